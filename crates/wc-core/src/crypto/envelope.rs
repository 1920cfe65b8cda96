//! Envelope wire format
//!
//! ```text
//! type 0: the JSON text itself, no key involved
//! type 1: 0x01 | sender public key (32) | iv (16) | sealed box
//! type 2: 0x02 | iv (16) | sealed box
//! ```
//!
//! A sealed box is AES-256-GCM ciphertext followed by its 16-byte tag. The
//! whole blob is base64 (standard alphabet, padded) for transport. A JSON
//! text never starts with byte 0x01 or 0x02, so type 0 needs no prefix.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};

pub const TYPE_0: u8 = 0;
pub const TYPE_1: u8 = 1;
pub const TYPE_2: u8 = 2;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 16;
pub const TAG_LENGTH: usize = 16;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Decoded envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// Type 0 passthrough
    Plain { message: Vec<u8> },
    /// Type 1: carries the sender's public key so a receiver holding only
    /// its own keypair can derive the symmetric key
    OneShot {
        sender_public_key: [u8; KEY_LENGTH],
        iv: [u8; IV_LENGTH],
        sealed: Vec<u8>,
    },
    /// Type 2: sealed with a key both sides already hold for the topic
    Sealed { iv: [u8; IV_LENGTH], sealed: Vec<u8> },
}

impl Envelope {
    pub fn type_byte(&self) -> u8 {
        match self {
            Envelope::Plain { .. } => TYPE_0,
            Envelope::OneShot { .. } => TYPE_1,
            Envelope::Sealed { .. } => TYPE_2,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Envelope::Plain { message } => message.clone(),
            Envelope::OneShot {
                sender_public_key,
                iv,
                sealed,
            } => {
                let mut buf = BytesMut::with_capacity(1 + KEY_LENGTH + IV_LENGTH + sealed.len());
                buf.put_u8(TYPE_1);
                buf.put_slice(sender_public_key);
                buf.put_slice(iv);
                buf.put_slice(sealed);
                buf.to_vec()
            }
            Envelope::Sealed { iv, sealed } => {
                let mut buf = BytesMut::with_capacity(1 + IV_LENGTH + sealed.len());
                buf.put_u8(TYPE_2);
                buf.put_slice(iv);
                buf.put_slice(sealed);
                buf.to_vec()
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&type_byte, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Envelope("empty envelope".into()))?;

        match type_byte {
            TYPE_1 => {
                if rest.len() < KEY_LENGTH {
                    return Err(Error::Envelope("truncated sender public key".into()));
                }
                let (key, rest) = rest.split_at(KEY_LENGTH);
                let mut sender_public_key = [0u8; KEY_LENGTH];
                sender_public_key.copy_from_slice(key);
                let (iv, sealed) = split_sealed(rest)?;
                Ok(Envelope::OneShot {
                    sender_public_key,
                    iv,
                    sealed,
                })
            }
            TYPE_2 => {
                let (iv, sealed) = split_sealed(rest)?;
                Ok(Envelope::Sealed { iv, sealed })
            }
            other if other < 0x20 && !matches!(other, b'\t' | b'\n' | b'\r') => {
                Err(Error::Envelope(format!("unknown envelope type {other}")))
            }
            _ => {
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::Envelope("type 0 payload is not utf-8".into()))?;
                Ok(Envelope::Plain {
                    message: bytes.to_vec(),
                })
            }
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Envelope(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

fn split_sealed(rest: &[u8]) -> Result<([u8; IV_LENGTH], Vec<u8>)> {
    if rest.len() < IV_LENGTH + TAG_LENGTH {
        return Err(Error::Envelope(format!(
            "sealed payload too short: {} bytes",
            rest.len()
        )));
    }
    let (iv_bytes, sealed) = rest.split_at(IV_LENGTH);
    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(iv_bytes);
    Ok((iv, sealed.to_vec()))
}

/// Seal `plaintext` with AES-256-GCM under a 16-byte IV
pub fn seal(key: &[u8; KEY_LENGTH], iv: &[u8; IV_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm16::new_from_slice(key)
        .map_err(|_| Error::InvalidParams("invalid symmetric key length".into()))?;
    cipher
        .encrypt(Nonce::<U16>::from_slice(iv), plaintext)
        .map_err(|_| Error::InvalidParams("encryption failed".into()))
}

/// Open a sealed box. A tag mismatch is [`Error::AuthenticationFailed`].
pub fn open(key: &[u8; KEY_LENGTH], iv: &[u8; IV_LENGTH], sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm16::new_from_slice(key)
        .map_err(|_| Error::InvalidParams("invalid symmetric key length".into()))?;
    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), sealed)
        .map_err(|_| Error::AuthenticationFailed)
}
