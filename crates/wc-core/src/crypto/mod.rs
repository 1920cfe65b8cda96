//! Key management and payload encryption
//!
//! - X25519 keypairs stored under their public key
//! - Shared symmetric keys: HKDF-SHA256 over the X25519 agreement, stored
//!   under `sha256(symKey)` (the topic) unless a topic is supplied
//! - AES-256-GCM sealed envelopes and the type 0 passthrough (see [`envelope`])
//! - EdDSA JWTs for relay auth (see [`jwt`])

pub mod envelope;
pub mod jwt;
pub mod keychain;

use crate::error::{Error, Result};
use ed25519_dalek::SigningKey;
use envelope::{Envelope, IV_LENGTH, KEY_LENGTH, TYPE_0, TYPE_1, TYPE_2};
use hkdf::Hkdf;
use keychain::KeyChain;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use x25519_dalek::{PublicKey, StaticSecret};

/// Keychain tag holding the client's ed25519 identity seed
pub const CLIENT_SEED_TAG: &str = "client_ed25519_seed";

/// Parameters for [`Crypto::encrypt`]
#[derive(Clone, Debug)]
pub struct EncryptParams<'a> {
    pub message: &'a str,
    pub sym_key_tag: &'a str,
    pub envelope_type: u8,
    pub iv: Option<[u8; IV_LENGTH]>,
    pub sender_public_key: Option<&'a str>,
}

impl<'a> EncryptParams<'a> {
    pub fn new(message: &'a str, sym_key_tag: &'a str) -> Self {
        Self {
            message,
            sym_key_tag,
            envelope_type: TYPE_2,
            iv: None,
            sender_public_key: None,
        }
    }
}

/// Options for [`Crypto::encode`]. The default seals with the topic key.
#[derive(Clone, Debug)]
pub struct EncodeOptions {
    pub envelope_type: u8,
    pub sender_public_key: Option<String>,
    pub receiver_public_key: Option<String>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            envelope_type: TYPE_2,
            sender_public_key: None,
            receiver_public_key: None,
        }
    }
}

impl EncodeOptions {
    /// Unencrypted type 0 payload
    pub fn plain() -> Self {
        Self {
            envelope_type: TYPE_0,
            ..Self::default()
        }
    }

    /// One-shot type 1 envelope from `sender` to `receiver`
    pub fn type_one(sender_public_key: impl Into<String>, receiver_public_key: impl Into<String>) -> Self {
        Self {
            envelope_type: TYPE_1,
            sender_public_key: Some(sender_public_key.into()),
            receiver_public_key: Some(receiver_public_key.into()),
        }
    }
}

/// Options for [`Crypto::decrypt`] and [`Crypto::decode`]
#[derive(Clone, Debug, Default)]
pub struct DecodeOptions {
    /// Local keypair to use for a type 1 envelope
    pub receiver_public_key: Option<String>,
}

/// SHA-256 over the raw bytes of a hex key
pub fn hash_key(key: &str) -> Result<String> {
    let bytes = hex::decode(key).map_err(|e| Error::InvalidParams(format!("invalid hex key: {e}")))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}

/// SHA-256 over a UTF-8 message
pub fn hash_message(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// 32 random bytes, hex encoded
pub fn generate_random_bytes32() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the symmetric key for an X25519 agreement
pub fn derive_sym_key(private_key: &str, peer_public_key: &str) -> Result<[u8; KEY_LENGTH]> {
    let secret = StaticSecret::from(decode_key(private_key)?);
    let peer = PublicKey::from(decode_key(peer_public_key)?);
    let shared = secret.diffie_hellman(&peer);

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut sym_key = [0u8; KEY_LENGTH];
    hkdf.expand(&[], &mut sym_key)
        .map_err(|_| Error::InvalidParams("key derivation failed".into()))?;
    Ok(sym_key)
}

fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = hex::decode(key).map_err(|e| Error::InvalidParams(format!("invalid hex key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidParams(format!("key must be {KEY_LENGTH} bytes")))
}

fn random_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Crypto module owning all key material
pub struct Crypto {
    keychain: Arc<KeyChain>,
    initialized: AtomicBool,
}

impl Crypto {
    pub fn new(keychain: Arc<KeyChain>) -> Self {
        Self {
            keychain,
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore the keychain and make sure an identity seed exists
    pub async fn init(&self) -> Result<()> {
        self.keychain.init().await?;
        if !self.keychain.has(CLIENT_SEED_TAG) {
            self.keychain
                .set(CLIENT_SEED_TAG, &generate_random_bytes32())
                .await?;
            debug!("generated client identity seed");
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn keychain(&self) -> &Arc<KeyChain> {
        &self.keychain
    }

    pub fn has_keys(&self, tag: &str) -> bool {
        self.keychain.has(tag)
    }

    /// Generate an X25519 keypair, returning the hex public key
    pub async fn generate_key_pair(&self) -> Result<String> {
        self.check_initialized()?;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let public_key = hex::encode(public.as_bytes());
        self.keychain
            .set(&public_key, &hex::encode(secret.to_bytes()))
            .await?;
        Ok(public_key)
    }

    /// Agree a symmetric key with `peer_public_key` and store it.
    /// Returns the topic it was stored under.
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<&str>,
    ) -> Result<String> {
        self.check_initialized()?;
        let private_key = self.keychain.get(self_public_key)?;
        let sym_key = derive_sym_key(&private_key, peer_public_key)?;
        self.set_sym_key(&hex::encode(sym_key), override_topic).await
    }

    /// Store a caller-supplied symmetric key. Returns its topic.
    pub async fn set_sym_key(&self, sym_key: &str, override_topic: Option<&str>) -> Result<String> {
        self.check_initialized()?;
        decode_key(sym_key)?;
        let topic = match override_topic {
            Some(topic) => topic.to_string(),
            None => hash_key(sym_key)?,
        };
        self.keychain.set(&topic, sym_key).await?;
        Ok(topic)
    }

    pub async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.check_initialized()?;
        self.keychain.delete(public_key).await
    }

    pub async fn delete_sym_key(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.keychain.delete(topic).await
    }

    /// Seal `message` under the key stored for `sym_key_tag`. Type 0
    /// needs no key and returns the message base64 encoded.
    pub fn encrypt(&self, params: EncryptParams<'_>) -> Result<String> {
        self.check_initialized()?;
        let sender_public_key = match (params.envelope_type, params.sender_public_key) {
            (TYPE_0, None) => {
                let message = params.message.as_bytes().to_vec();
                return Ok(Envelope::Plain { message }.to_base64());
            }
            (TYPE_0 | TYPE_2, Some(_)) => {
                return Err(Error::InvalidParams(format!(
                    "type {} envelope cannot carry a sender public key",
                    params.envelope_type
                )))
            }
            (TYPE_1, Some(sender)) => Some(decode_key(sender)?),
            (TYPE_1, None) => {
                return Err(Error::InvalidParams(
                    "type 1 envelope requires a sender public key".into(),
                ))
            }
            (TYPE_2, None) => None,
            (other, _) => return Err(Error::InvalidParams(format!("unknown envelope type {other}"))),
        };

        let key = decode_key(&self.keychain.get(params.sym_key_tag)?)?;
        let iv = params.iv.unwrap_or_else(random_iv);
        let sealed = envelope::seal(&key, &iv, params.message.as_bytes())?;

        let envelope = match sender_public_key {
            Some(sender_public_key) => Envelope::OneShot {
                sender_public_key,
                iv,
                sealed,
            },
            None => Envelope::Sealed { iv, sealed },
        };
        Ok(envelope.to_base64())
    }

    /// Open an envelope received on `topic`.
    ///
    /// Type 1 keys are resolved in this order: the explicit receiver
    /// keypair, then the topic's stored key, then every local keypair in
    /// ascending public-key order. The first key whose tag verifies wins
    /// and the derived key is stored under its own topic.
    pub async fn decrypt(&self, topic: &str, encoded: &str, options: &DecodeOptions) -> Result<String> {
        self.check_initialized()?;
        let plaintext = match Envelope::from_base64(encoded)? {
            Envelope::Plain { message } => message,
            Envelope::Sealed { iv, sealed } => {
                let key = self.keychain.get(topic).map_err(|_| {
                    Error::MissingDecryptParams(format!("no symmetric key for topic {topic}"))
                })?;
                envelope::open(&decode_key(&key)?, &iv, &sealed)?
            }
            Envelope::OneShot {
                sender_public_key,
                iv,
                sealed,
            } => {
                self.open_type_one(topic, &iv, &sealed, &hex::encode(sender_public_key), options)
                    .await?
            }
        };

        String::from_utf8(plaintext)
            .map_err(|_| Error::Envelope("decrypted payload is not utf-8".into()))
    }

    async fn open_type_one(
        &self,
        topic: &str,
        iv: &[u8; IV_LENGTH],
        sealed: &[u8],
        sender_public_key: &str,
        options: &DecodeOptions,
    ) -> Result<Vec<u8>> {
        if let Some(receiver) = &options.receiver_public_key {
            let private_key = self.keychain.get(receiver)?;
            let sym_key = derive_sym_key(&private_key, sender_public_key)?;
            let plaintext = envelope::open(&sym_key, iv, sealed)?;
            self.set_sym_key(&hex::encode(sym_key), None).await?;
            return Ok(plaintext);
        }

        if let Ok(key) = self.keychain.get(topic) {
            match envelope::open(&decode_key(&key)?, iv, sealed) {
                Ok(plaintext) => return Ok(plaintext),
                Err(Error::AuthenticationFailed) => {
                    trace!(topic, "topic key rejected type 1 envelope, scanning keypairs");
                }
                Err(e) => return Err(e),
            }
        }

        for (public_key, private_key) in self.local_key_pairs() {
            let Ok(sym_key) = derive_sym_key(&private_key, sender_public_key) else {
                continue;
            };
            if let Ok(plaintext) = envelope::open(&sym_key, iv, sealed) {
                debug!(receiver = %public_key, "resolved type 1 envelope key");
                self.set_sym_key(&hex::encode(sym_key), None).await?;
                return Ok(plaintext);
            }
        }

        Err(Error::MissingDecryptParams(format!(
            "no local keypair opens type 1 envelope on topic {topic}"
        )))
    }

    /// Keychain entries whose tag is the X25519 public key of their value
    fn local_key_pairs(&self) -> Vec<(String, String)> {
        self.keychain
            .entries()
            .into_iter()
            .filter(|(tag, value)| {
                decode_key(value)
                    .map(|secret| {
                        hex::encode(PublicKey::from(&StaticSecret::from(secret)).as_bytes()) == *tag
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Serialize and seal a payload for `topic`
    pub async fn encode<T: Serialize + Sync>(
        &self,
        topic: &str,
        payload: &T,
        options: &EncodeOptions,
    ) -> Result<String> {
        self.check_initialized()?;
        let message = serde_json::to_string(payload)?;

        if options.envelope_type == TYPE_1 {
            let (sender, receiver) = match (&options.sender_public_key, &options.receiver_public_key) {
                (Some(s), Some(r)) => (s.as_str(), r.as_str()),
                _ => {
                    return Err(Error::InvalidParams(
                        "type 1 encoding requires sender and receiver public keys".into(),
                    ))
                }
            };
            let sym_key_tag = self.generate_shared_key(sender, receiver, None).await?;
            return self.encrypt(EncryptParams {
                message: &message,
                sym_key_tag: &sym_key_tag,
                envelope_type: TYPE_1,
                iv: None,
                sender_public_key: Some(sender),
            });
        }

        self.encrypt(EncryptParams {
            envelope_type: options.envelope_type,
            ..EncryptParams::new(&message, topic)
        })
    }

    /// Open and deserialize a payload received on `topic`.
    ///
    /// Raw JSON is accepted as-is on topics that have no key yet.
    pub async fn decode<T: DeserializeOwned>(
        &self,
        topic: &str,
        encoded: &str,
        options: &DecodeOptions,
    ) -> Result<T> {
        self.check_initialized()?;
        if encoded.trim_start().starts_with('{') && !self.keychain.has(topic) {
            return Ok(serde_json::from_str(encoded)?);
        }
        let message = self.decrypt(topic, encoded, options).await?;
        Ok(serde_json::from_str(&message)?)
    }

    /// Envelope type byte of an encoded message
    pub fn payload_type(encoded: &str) -> Result<u8> {
        Ok(Envelope::from_base64(encoded)?.type_byte())
    }

    /// Sender public key carried by a type 1 envelope
    pub fn payload_sender_public_key(encoded: &str) -> Result<Option<String>> {
        match Envelope::from_base64(encoded)? {
            Envelope::OneShot { sender_public_key, .. } => Ok(Some(hex::encode(sender_public_key))),
            Envelope::Plain { .. } | Envelope::Sealed { .. } => Ok(None),
        }
    }

    /// Client identity as a `did:key`
    pub fn client_id(&self) -> Result<String> {
        Ok(jwt::encode_iss(
            &self.identity()?.verifying_key().to_bytes(),
        ))
    }

    /// Issue a relay auth token for `aud`
    pub fn sign_jwt(&self, aud: &str) -> Result<String> {
        let identity = self.identity()?;
        jwt::sign_jwt(&identity, &generate_random_bytes32(), aud, jwt::JWT_TTL)
    }

    fn identity(&self) -> Result<SigningKey> {
        self.check_initialized()?;
        let seed = decode_key(&self.keychain.get(CLIENT_SEED_TAG)?)?;
        Ok(SigningKey::from_bytes(&seed))
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("crypto"))
        }
    }
}
