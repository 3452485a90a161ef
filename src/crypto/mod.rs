//! Crypto primitives (section 4.A). HKDF-SHA256, AES-256-GCM, SHA-256,
//! base64url, constant-time compare, CSPRNG bytes, and P-256 JWK
//! validation. Every fallible function here returns an opaque
//! `AppError::Validation`/`AppError::Crypto` — callers must not propagate
//! the underlying RustCrypto/base64 error text (section 4.A).

use crate::error::AppError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const AES_GCM_IV_LEN: usize = 12;
pub const AES_GCM_TAG_LEN: usize = 16;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn b64u_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64u_decode(data: &str) -> Result<Vec<u8>, AppError> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|_| AppError::Validation("invalid base64url encoding".to_string()))
}

/// `N` cryptographically secure random bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_bytes_vec(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time equality, used for CSRF double-submit comparison and
/// confidential-client secret comparison (section 8, testable property 5).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// HKDF-SHA256 extract-then-expand, collapsed into a single call the way
/// every caller in this crate uses it (KEK derivation inputs, DRK-JWE key
/// agreement salts).
pub fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; out_len];
    // out_len is always a small fixed constant from call sites (16/32/64
    // bytes); HKDF only fails when the caller asks for an absurd length.
    hk.expand(info, &mut okm)
        .expect("hkdf output length must be <= 255 * hash length");
    okm
}

/// AES-256-GCM seal: a random 12-byte IV is prepended to `ciphertext ||
/// tag`, matching section 4.B's "IV ∥ ciphertext ∥ tag" wire format.
pub fn aes256_gcm_seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AppError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let iv: [u8; AES_GCM_IV_LEN] = random_bytes();
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| AppError::Crypto)?;
    let mut out = Vec::with_capacity(iv.len() + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn aes256_gcm_open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, AppError> {
    if sealed.len() < AES_GCM_IV_LEN + AES_GCM_TAG_LEN {
        return Err(AppError::Crypto);
    }
    let (iv, ciphertext) = sealed.split_at(AES_GCM_IV_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AppError::Crypto)
}

/// A parsed-and-validated P-256 public JWK, per section 4.A: rejects any
/// object carrying a private component `d`, requires 32-byte `x`/`y`.
#[derive(Debug, Clone)]
pub struct ValidatedP256Jwk {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

#[derive(serde::Deserialize)]
struct RawJwk {
    kty: String,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
    d: Option<String>,
}

pub fn validate_p256_public_jwk(jwk_json: &str) -> Result<ValidatedP256Jwk, AppError> {
    let raw: RawJwk = serde_json::from_str(jwk_json)
        .map_err(|_| AppError::Validation("zk_pub is not valid JSON".to_string()))?;

    if raw.d.is_some() {
        return Err(AppError::Validation(
            "zk_pub must not contain a private key component".to_string(),
        ));
    }
    if raw.kty != "EC" {
        return Err(AppError::Validation("zk_pub.kty must be EC".to_string()));
    }
    if raw.crv.as_deref() != Some("P-256") {
        return Err(AppError::Validation("zk_pub.crv must be P-256".to_string()));
    }
    let x_str = raw
        .x
        .ok_or_else(|| AppError::Validation("zk_pub.x is required".to_string()))?;
    let y_str = raw
        .y
        .ok_or_else(|| AppError::Validation("zk_pub.y is required".to_string()))?;

    let x_bytes = b64u_decode(&x_str)?;
    let y_bytes = b64u_decode(&y_str)?;
    if x_bytes.len() != 32 || y_bytes.len() != 32 {
        return Err(AppError::Validation(
            "zk_pub.x/y must each be 32 bytes".to_string(),
        ));
    }

    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(&x_bytes);
    y.copy_from_slice(&y_bytes);
    Ok(ValidatedP256Jwk { x, y })
}

/// `zkPubKid`: SHA-256 base64url digest of the validated JWK's canonical
/// `{crv,kty,x,y}` member ordering (RFC 7638 thumbprint without the
/// optional members), per the pending-authorization record in section 3.
pub fn zk_pub_kid(jwk: &ValidatedP256Jwk) -> String {
    let canonical = format!(
        "{{\"crv\":\"P-256\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
        b64u_encode(&jwk.x),
        b64u_encode(&jwk.y)
    );
    b64u_encode(&sha256(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64u_round_trips() {
        let data = b"hello opaque world";
        let encoded = b64u_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(b64u_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn aes_gcm_round_trips_and_detects_tamper() {
        let key = random_bytes::<32>();
        let plaintext = b"wrapped signing key material";
        let sealed = aes256_gcm_seal(&key, plaintext, b"aad").unwrap();
        let opened = aes256_gcm_open(&key, &sealed, b"aad").unwrap();
        assert_eq!(opened, plaintext);

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(aes256_gcm_open(&key, &tampered, b"aad").is_err());
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"abc", b"abc"));
    }

    #[test]
    fn rejects_private_component() {
        let jwk = r#"{"kty":"EC","crv":"P-256","x":"AA","y":"AA","d":"secret"}"#;
        assert!(validate_p256_public_jwk(jwk).is_err());
    }
}
