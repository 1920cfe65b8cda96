//! Self-signed EdDSA JWTs for relay authentication
//!
//! The issuer is the client's ed25519 identity encoded as a `did:key`:
//! `did:key:z` + base58btc(0xed 0x01 || public key).

use crate::error::{Error, Result};
use crate::time::{unix_now, ONE_DAY};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

pub const JWT_ALG: &str = "EdDSA";
pub const JWT_TYP: &str = "JWT";
pub const JWT_TTL: u64 = ONE_DAY;

const DID_KEY_PREFIX: &str = "did:key:";
const MULTIBASE_BASE58BTC: char = 'z';
const MULTICODEC_ED25519_HEADER: [u8; 2] = [0xed, 0x01];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for JwtHeader {
    fn default() -> Self {
        Self {
            alg: JWT_ALG.to_string(),
            typ: JWT_TYP.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Encode an ed25519 public key as a `did:key` issuer
pub fn encode_iss(public_key: &[u8; 32]) -> String {
    let mut multicodec = Vec::with_capacity(34);
    multicodec.extend_from_slice(&MULTICODEC_ED25519_HEADER);
    multicodec.extend_from_slice(public_key);
    format!(
        "{DID_KEY_PREFIX}{MULTIBASE_BASE58BTC}{}",
        bs58::encode(multicodec).into_string()
    )
}

/// Recover the ed25519 public key from a `did:key` issuer
pub fn decode_iss(iss: &str) -> Result<[u8; 32]> {
    let multibase = iss
        .strip_prefix(DID_KEY_PREFIX)
        .and_then(|s| s.strip_prefix(MULTIBASE_BASE58BTC))
        .ok_or_else(|| Error::InvalidParams(format!("not an ed25519 did:key: {iss}")))?;
    let bytes = bs58::decode(multibase)
        .into_vec()
        .map_err(|e| Error::InvalidParams(format!("invalid base58 in did:key: {e}")))?;
    if bytes.len() != 34 || bytes[..2] != MULTICODEC_ED25519_HEADER {
        return Err(Error::InvalidParams("did:key is not an ed25519 key".into()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes[2..]);
    Ok(key)
}

/// Issue `header.claims.signature`, each segment base64url without padding
pub fn sign_jwt(signing_key: &SigningKey, sub: &str, aud: &str, ttl: u64) -> Result<String> {
    let iat = unix_now();
    let claims = JwtClaims {
        iss: encode_iss(&signing_key.verifying_key().to_bytes()),
        sub: sub.to_string(),
        aud: aud.to_string(),
        iat,
        exp: iat + ttl as i64,
    };

    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&JwtHeader::default())?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let data = format!("{header}.{payload}");
    let signature = signing_key.sign(data.as_bytes());

    Ok(format!(
        "{data}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verify a token against the key named by its own issuer
pub fn verify_jwt(token: &str) -> Result<JwtClaims> {
    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => return Err(Error::InvalidParams("jwt must have three segments".into())),
    };

    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|e| Error::InvalidParams(format!("invalid jwt segment: {e}")))
    };

    let header: JwtHeader = serde_json::from_slice(&decode(header)?)?;
    if header.alg != JWT_ALG {
        return Err(Error::InvalidParams(format!("unsupported jwt alg {}", header.alg)));
    }
    let claims: JwtClaims = serde_json::from_slice(&decode(payload)?)?;

    let signature_bytes: [u8; 64] = decode(signature)?
        .try_into()
        .map_err(|_| Error::InvalidParams("jwt signature must be 64 bytes".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&decode_iss(&claims.iss)?)
        .map_err(|_| Error::InvalidParams("invalid issuer key".into()))?;
    let data = &token[..token.len() - signature.len() - 1];
    verifying_key
        .verify(data.as_bytes(), &Signature::from_bytes(&signature_bytes))
        .map_err(|_| Error::AuthenticationFailed)?;

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iss_round_trip() {
        let key = SigningKey::from_bytes(&[5; 32]);
        let public = key.verifying_key().to_bytes();
        let iss = encode_iss(&public);

        assert!(iss.starts_with("did:key:z6Mk"));
        assert_eq!(decode_iss(&iss).unwrap(), public);
        assert!(decode_iss("did:web:example.com").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let token = sign_jwt(&key, "abcd", "wss://relay.walletconnect.com", JWT_TTL).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = verify_jwt(&token).unwrap();
        assert_eq!(claims.aud, "wss://relay.walletconnect.com");
        assert_eq!(claims.sub, "abcd");
        assert_eq!(claims.exp - claims.iat, JWT_TTL as i64);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let token = sign_jwt(&key, "abcd", "aud", JWT_TTL).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"iss":"x","sub":"y","aud":"z","iat":0,"exp":1}"#);
        parts[1] = &forged;
        assert!(verify_jwt(&parts.join(".")).is_err());
    }
}
