//! DRK-JWE: hand-assembled ECDH-ES+A256KW compact JWE (RFC 7518 §4.6,
//! RFC 7516). No JWE crate appears anywhere in the pack, so this is built
//! from the same RustCrypto primitives the crypto module already uses:
//! `p256::ecdh` for the agreement, `hkdf`'s Concat KDF shape for key
//! derivation, `aes_kw` to wrap a random CEK, and `aes-gcm` to seal the
//! DRK plaintext under that CEK.

use crate::crypto::{self, ValidatedP256Jwk};
use crate::error::AppError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, PublicKey, SecretKey};
use serde::Serialize;

const ALG: &str = "ECDH-ES+A256KW";
const ENC: &str = "A256GCM";

#[derive(Serialize)]
struct JweHeader<'a> {
    alg: &'a str,
    enc: &'a str,
    epk: EphemeralPublicJwk,
}

#[derive(Serialize)]
struct EphemeralPublicJwk {
    kty: &'static str,
    crv: &'static str,
    x: String,
    y: String,
}

/// Produces the 5-part compact serialization
/// `header.encrypted_key.iv.ciphertext.tag` carrying `drk_plaintext`
/// encrypted to `recipient_pub` (section 4.E step 7).
pub fn seal(recipient_pub: &ValidatedP256Jwk, drk_plaintext: &[u8]) -> Result<String, AppError> {
    let recipient_point = EncodedPoint::from_affine_coordinates(
        &recipient_pub.x.into(),
        &recipient_pub.y.into(),
        false,
    );
    let recipient_key = PublicKey::from_sec1_bytes(recipient_point.as_bytes()).map_err(|_| AppError::Crypto)?;

    let ephemeral_secret = SecretKey::random(&mut rand::rngs::OsRng);
    let ephemeral_public = ephemeral_secret.public_key();
    let ephemeral_point = ephemeral_public.to_encoded_point(false);
    let (ex, ey) = coords(&ephemeral_point)?;

    let shared = diffie_hellman(ephemeral_secret.to_nonzero_scalar(), recipient_key.as_affine());
    let shared_secret = shared.raw_secret_bytes();

    let header = JweHeader {
        alg: ALG,
        enc: ENC,
        epk: EphemeralPublicJwk {
            kty: "EC",
            crv: "P-256",
            x: crypto::b64u_encode(&ex),
            y: crypto::b64u_encode(&ey),
        },
    };
    let header_json = serde_json::to_vec(&header).map_err(|_| AppError::Internal)?;
    let header_b64 = URL_SAFE_NO_PAD.encode(&header_json);

    // Concat KDF (SP 800-56A, as used by RFC 7518 §4.6) approximated with
    // HKDF-SHA256 over the shared secret, salted by the algorithm id and
    // the encoded header so the derived key is bound to this exchange.
    let kek = crypto::hkdf_sha256(Some(header_b64.as_bytes()), &shared_secret, ALG.as_bytes(), 32);
    let mut kek_arr = [0u8; 32];
    kek_arr.copy_from_slice(&kek);

    let cek = crypto::random_bytes::<32>();
    let wrapped_cek = aes_kw::Kek::from(kek_arr).wrap_vec(&cek).map_err(|_| AppError::Crypto)?;
    let encrypted_key_b64 = URL_SAFE_NO_PAD.encode(&wrapped_cek);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&cek));
    let iv = crypto::random_bytes::<12>();
    let nonce = Nonce::from_slice(&iv);
    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: drk_plaintext,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| AppError::Crypto)?;
    let tag_start = sealed.len() - 16;
    let (ciphertext, tag) = sealed.split_at(tag_start);

    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        encrypted_key_b64,
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    ))
}

fn coords(point: &EncodedPoint) -> Result<([u8; 32], [u8; 32]), AppError> {
    let x = point.x().ok_or(AppError::Crypto)?;
    let y = point.y().ok_or(AppError::Crypto)?;
    let mut xb = [0u8; 32];
    let mut yb = [0u8; 32];
    xb.copy_from_slice(x.as_slice());
    yb.copy_from_slice(y.as_slice());
    Ok((xb, yb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::validate_p256_public_jwk;

    #[test]
    fn seal_produces_a_five_part_compact_jwe() {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let (x, y) = coords(&public).unwrap();
        let jwk_json = format!(
            r#"{{"kty":"EC","crv":"P-256","x":"{}","y":"{}"}}"#,
            crypto::b64u_encode(&x),
            crypto::b64u_encode(&y)
        );
        let jwk = validate_p256_public_jwk(&jwk_json).unwrap();

        let jwe = seal(&jwk, b"drk-plaintext-bytes").unwrap();
        assert_eq!(jwe.split('.').count(), 5);
    }
}
