//! KEK & key store (section 4.B). Derives a 256-bit key-encryption key
//! from the operator passphrase with Argon2id, wraps/unwraps signing keys
//! and client secrets under it, and publishes JWKS.

use crate::clock::Clock;
use crate::crypto::{self, random_bytes};
use crate::error::AppError;
use crate::store::{SigningKeyRow, Store};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::JwkEcKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Argon2id parameters for KEK derivation, persisted in the `kek_kdf`
/// settings row so every future launch reproduces the same KEK from the
/// same passphrase (section 4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KekKdfParams {
    pub salt_b64: String,
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KekKdfParams {
    pub fn generate() -> Self {
        KekKdfParams {
            salt_b64: STANDARD.encode(random_bytes::<16>()),
            m_cost_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }

    #[cfg(any(test, feature = "test-fast-kek"))]
    pub fn generate_fast() -> Self {
        KekKdfParams {
            salt_b64: STANDARD.encode(random_bytes::<16>()),
            m_cost_kib: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

pub const SETTINGS_KEY_KEK_KDF: &str = "kek_kdf";

/// Derives the KEK and holds it only in process memory; it is never
/// serialized (section 5, "Shared resources").
pub struct KekService {
    key: [u8; 32],
}

impl KekService {
    pub fn derive(passphrase: &str, params: &KekKdfParams) -> Result<Self, AppError> {
        let salt = STANDARD
            .decode(&params.salt_b64)
            .map_err(|_| AppError::Crypto)?;
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
                .map_err(|_| AppError::Internal)?,
        );
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|_| AppError::Crypto)?;
        Ok(KekService { key })
    }

    pub fn is_available(&self) -> bool {
        true
    }

    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
        crypto::aes256_gcm_seal(&self.key, plaintext, b"darkauth-kek")
    }

    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, AppError> {
        crypto::aes256_gcm_open(&self.key, wrapped, b"darkauth-kek")
    }
}

/// An unwrapped signing key ready to mint tokens with (section 4.B
/// `getLatestSigningKey`).
pub struct ActiveSigningKey {
    pub kid: String,
    pub signing_key: SigningKey,
}

/// Loads the active signing key and unwraps its private material. Callers
/// at startup treat failure as fatal and exit the process (section 4.B).
pub fn load_active_signing_key(
    store: &dyn Store,
    kek: &KekService,
) -> Result<ActiveSigningKey, AppError> {
    let row = store.signing_keys_get_active()?.ok_or(AppError::Internal)?;
    let der = kek.unwrap(&row.wrapped_private_key)?;
    let signing_key =
        SigningKey::from_pkcs8_der(&der).map_err(|_| AppError::Crypto)?;
    Ok(ActiveSigningKey {
        kid: row.kid,
        signing_key,
    })
}

/// Generates a fresh ES256 keypair, wraps the private half under the KEK
/// and stores it as the new active key; the previously-active key (if
/// any) is flipped to inactive but never deleted (section 4.B rotation).
pub fn rotate_signing_key(store: &dyn Store, kek: &KekService) -> Result<String, AppError> {
    let signing_key = SigningKey::random(&mut rand_core_compat());
    let kid = uuid::Uuid::new_v4().to_string();
    let pkcs8 = signing_key
        .to_pkcs8_der()
        .map_err(|_| AppError::Internal)?;
    let wrapped = kek.wrap(pkcs8.as_bytes())?;
    let public_jwk = public_jwk_json(&signing_key, &kid)?;

    store.signing_keys_insert(SigningKeyRow {
        kid: kid.clone(),
        wrapped_private_key: wrapped,
        public_jwk,
        created_at: crate::clock::SystemClock.unix_seconds(),
        active: true,
    })?;
    Ok(kid)
}

/// `p256`'s RNG trait bound is `rand_core` 0.6; `rand` 0.9's `OsRng`
/// already implements that trait, this just names the conversion point so
/// callers don't have to think about which `rand_core` version is in
/// scope.
fn rand_core_compat() -> rand::rngs::OsRng {
    rand::rngs::OsRng
}

fn public_jwk_json(signing_key: &SigningKey, kid: &str) -> Result<String, AppError> {
    let verifying_key = signing_key.verifying_key();
    let public_key = p256::PublicKey::from(verifying_key);
    let jwk: JwkEcKey = public_key.to_jwk();
    let mut value = serde_json::to_value(&jwk).map_err(|_| AppError::Internal)?;
    let obj = value.as_object_mut().ok_or(AppError::Internal)?;
    obj.insert("kid".to_string(), serde_json::Value::String(kid.to_string()));
    obj.insert(
        "alg".to_string(),
        serde_json::Value::String("ES256".to_string()),
    );
    obj.insert("use".to_string(), serde_json::Value::String("sig".to_string()));
    Ok(serde_json::to_string(&value).map_err(|_| AppError::Internal)?)
}

/// The full JWKS document: every non-retired public key (section 4.B
/// `jwks()`, testable property 9 — never includes private material since
/// `SigningKeyRow::public_jwk` is the only field read here).
pub fn jwks(store: &dyn Store) -> Result<serde_json::Value, AppError> {
    let rows = store.signing_keys_list_non_retired()?;
    let keys: Result<Vec<serde_json::Value>, AppError> = rows
        .iter()
        .map(|row| serde_json::from_str(&row.public_jwk).map_err(|_| AppError::Internal))
        .collect();
    Ok(serde_json::json!({ "keys": keys? }))
}

/// Read-mostly cache of the active signing key, refreshed at startup and
/// on explicit rotation (section 5, "Shared resources").
pub struct SigningKeyCache {
    inner: RwLock<ActiveSigningKey>,
}

impl SigningKeyCache {
    pub fn new(initial: ActiveSigningKey) -> Self {
        SigningKeyCache {
            inner: RwLock::new(initial),
        }
    }

    pub fn current_kid(&self) -> String {
        self.inner.read().unwrap().kid.clone()
    }

    pub fn with_signing_key<R>(&self, f: impl FnOnce(&str, &SigningKey) -> R) -> R {
        let guard = self.inner.read().unwrap();
        f(&guard.kid, &guard.signing_key)
    }

    pub fn replace(&self, new_key: ActiveSigningKey) {
        let mut guard = self.inner.write().unwrap();
        *guard = new_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips_and_detects_tamper() {
        let params = KekKdfParams::generate_fast();
        let kek = KekService::derive("correct horse battery staple", &params).unwrap();
        let wrapped = kek.wrap(b"super secret signing key").unwrap();
        assert_eq!(kek.unwrap(&wrapped).unwrap(), b"super secret signing key");

        let mut tampered = wrapped.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(kek.unwrap(&tampered).is_err());
    }

    #[test]
    fn same_passphrase_and_params_reproduce_the_same_kek() {
        let params = KekKdfParams::generate_fast();
        let kek_a = KekService::derive("operator-passphrase", &params).unwrap();
        let kek_b = KekService::derive("operator-passphrase", &params).unwrap();
        let wrapped = kek_a.wrap(b"payload").unwrap();
        assert_eq!(kek_b.unwrap(&wrapped).unwrap(), b"payload");
    }
}
