//! OPAQUE augmented PAKE engine (section 4.C). Wraps `opaque-ke` with the
//! ristretto255 ciphersuite, persists `ServerSetup` under the KEK, and
//! drives registration/login through the transient-session store so a
//! `ServerLogin` can survive across the two HTTP round trips.
//!
//! Logging here never prints envelope bytes, OPRF blinds, or message
//! bytes — only `[SESSION]`/`[USER]`/`[ERROR]` markers (section 4.C,
//! "Security considerations").

use crate::clock::Clock;
use crate::error::AppError;
use crate::kek::KekService;
use crate::store::{OpaqueRecordRow, Store};
use opaque_ke::{
    CipherSuite, CredentialFinalization, CredentialRequest, RegistrationRequest,
    RegistrationUpload, ServerLogin, ServerLoginStartParameters, ServerRegistration, ServerSetup,
};
use rand::rngs::OsRng;
use std::time::Duration;

pub struct DarkAuthCipherSuite;

impl CipherSuite for DarkAuthCipherSuite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = opaque_ke::ksf::Identity;
}

const SETTINGS_KEY_SERVER_SETUP: &str = "opaque_server_setup";
const LOGIN_SESSION_TTL: Duration = Duration::from_secs(120);
const REGISTRATION_SESSION_TTL: Duration = Duration::from_secs(120);

/// Persists and caches the one `ServerSetup` this deployment ever uses;
/// rotating it would invalidate every stored envelope, so it is generated
/// once at first boot and wrapped at rest under the KEK (section 4.C).
pub struct OpaqueEngine {
    server_setup: ServerSetup<DarkAuthCipherSuite>,
}

impl OpaqueEngine {
    pub fn load_or_create(store: &dyn Store, kek: &KekService) -> Result<Self, AppError> {
        let server_setup = match store.settings_get(SETTINGS_KEY_SERVER_SETUP)? {
            Some(wrapped_b64) => {
                let wrapped = crate::crypto::b64u_decode(&wrapped_b64)?;
                let raw = kek.unwrap(&wrapped)?;
                ServerSetup::<DarkAuthCipherSuite>::deserialize(&raw)
                    .map_err(|_| AppError::Crypto)?
            }
            None => {
                let fresh = ServerSetup::<DarkAuthCipherSuite>::new(&mut OsRng);
                let wrapped = kek.wrap(&fresh.serialize())?;
                store.settings_set(SETTINGS_KEY_SERVER_SETUP, &crate::crypto::b64u_encode(&wrapped))?;
                fresh
            }
        };
        Ok(OpaqueEngine { server_setup })
    }

    /// Begins registration for `identity` (the email used as OPAQUE
    /// credential identifier). Binds `identity` to a transient session the
    /// same way `login_start` does, so `registration_finish` can verify the
    /// upload belongs to the session that started it rather than trusting
    /// a caller-supplied identity a second time (section 4.C's atomic
    /// session-validation contract).
    pub fn registration_start(
        &self,
        store: &dyn Store,
        clock: &dyn Clock,
        identity: &str,
        registration_request_bytes: &[u8],
    ) -> Result<(String, Vec<u8>), AppError> {
        let message = RegistrationRequest::<DarkAuthCipherSuite>::deserialize(registration_request_bytes)
            .map_err(|_| AppError::Validation("malformed registration request".to_string()))?;
        let result = ServerRegistration::<DarkAuthCipherSuite>::start(
            &self.server_setup,
            message,
            identity.as_bytes(),
        )
        .map_err(|_| AppError::Crypto)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let expires_at = clock.unix_seconds() + REGISTRATION_SESSION_TTL.as_secs() as i64;
        store.opaque_session_create(&session_id, identity.as_bytes().to_vec(), expires_at)?;

        tracing::info!(target: "opaque", "[USER] registration started");
        Ok((session_id, result.message.serialize().to_vec()))
    }

    /// Finishes registration: stores the resulting envelope as the
    /// account's only credential material (section 4.C, section 8
    /// invariant 2 — OPAQUE is the sole auth path). Rejects a
    /// `session_id` that is unknown, expired, or bound to a different
    /// identity than the one completing the upload.
    pub fn registration_finish(
        &self,
        store: &dyn Store,
        clock: &dyn Clock,
        session_id: &str,
        identity: &str,
        sub: &str,
        registration_upload_bytes: &[u8],
    ) -> Result<(), AppError> {
        let bound_identity = store
            .opaque_session_take(session_id)?
            .ok_or(AppError::Unauthorized)?;
        if bound_identity != identity.as_bytes() {
            return Err(AppError::Unauthorized);
        }

        let message = RegistrationUpload::<DarkAuthCipherSuite>::deserialize(registration_upload_bytes)
            .map_err(|_| AppError::Validation("malformed registration upload".to_string()))?;
        let server_registration =
            ServerRegistration::<DarkAuthCipherSuite>::finish(message);
        store.opaque_record_upsert(OpaqueRecordRow {
            sub: sub.to_string(),
            envelope: server_registration.serialize().to_vec(),
            updated_at: clock.unix_seconds(),
        })?;
        tracing::info!(target: "opaque", "[USER] registration finished");
        Ok(())
    }

    /// Begins login. When `identity` has no account, `ServerLogin::start`
    /// is still driven with `None` in place of a `ServerRegistration` —
    /// `opaque-ke`'s own simulated-credential path, so the response is
    /// indistinguishable from a real account's and no separate dummy-flow
    /// bookkeeping is needed on this side (section 4.C enumeration
    /// resistance, section 8 invariant 4).
    pub fn login_start(
        &self,
        store: &dyn Store,
        clock: &dyn Clock,
        identity: &str,
        credential_request_bytes: &[u8],
    ) -> Result<(String, Vec<u8>), AppError> {
        let message = CredentialRequest::<DarkAuthCipherSuite>::deserialize(credential_request_bytes)
            .map_err(|_| AppError::Validation("malformed credential request".to_string()))?;

        let record = store.opaque_record_get(identity).ok().flatten();
        let server_registration = record
            .map(|row| ServerRegistration::<DarkAuthCipherSuite>::deserialize(&row.envelope))
            .transpose()
            .map_err(|_| AppError::Internal)?;

        let result = ServerLogin::start(
            &mut OsRng,
            &self.server_setup,
            server_registration,
            message,
            identity.as_bytes(),
            ServerLoginStartParameters::default(),
        )
        .map_err(|_| AppError::Crypto)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let expires_at = clock.unix_seconds() + LOGIN_SESSION_TTL.as_secs() as i64;
        store.opaque_session_create(&session_id, result.state.serialize().to_vec(), expires_at)?;

        tracing::info!(target: "opaque", "[SESSION] login started");
        Ok((session_id, result.message.serialize().to_vec()))
    }

    /// Finishes login. Returns `Ok(None)` (not an error) when the
    /// credential finalization fails verification, so callers can apply
    /// the same generic "invalid credentials" response used for unknown
    /// identities (section 4.C, section 8 invariant 4).
    pub fn login_finish(
        &self,
        store: &dyn Store,
        session_id: &str,
        credential_finalization_bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, AppError> {
        let Some(state_bytes) = store.opaque_session_take(session_id)? else {
            return Err(AppError::Unauthorized);
        };
        let state = ServerLogin::<DarkAuthCipherSuite>::deserialize(&state_bytes)
            .map_err(|_| AppError::Internal)?;
        let message =
            CredentialFinalization::<DarkAuthCipherSuite>::deserialize(credential_finalization_bytes)
                .map_err(|_| AppError::Validation("malformed credential finalization".to_string()))?;

        match state.finish(message) {
            Ok(result) => {
                tracing::info!(target: "opaque", "[SESSION] login finished");
                Ok(Some(result.session_key.to_vec()))
            }
            Err(_) => {
                tracing::info!(target: "opaque", "[ERROR] login finalization rejected");
                Ok(None)
            }
        }
    }

    pub fn sweep_expired_sessions(&self, store: &dyn Store, now: i64) -> Result<u64, AppError> {
        store.opaque_session_sweep_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kek::KekKdfParams;
    use crate::store::sqlite::SqliteStore;
    use opaque_ke::{ClientLoginFinishParameters, ClientRegistration, ClientRegistrationFinishParameters};

    fn engine() -> (SqliteStore, KekService, OpaqueEngine) {
        let store = SqliteStore::open_in_memory().unwrap();
        let params = KekKdfParams::generate_fast();
        let kek = KekService::derive("test-passphrase", &params).unwrap();
        let engine = OpaqueEngine::load_or_create(&store, &kek).unwrap();
        (store, kek, engine)
    }

    #[test]
    fn full_registration_and_login_round_trip_succeeds() {
        let (store, _kek, engine) = engine();
        let clock = SystemClock;
        let identity = "user@example.com";
        let password = b"correct horse battery staple";

        let client_reg_start = ClientRegistration::<DarkAuthCipherSuite>::start(&mut OsRng, password).unwrap();
        let (reg_session_id, reg_response_bytes) = engine
            .registration_start(&store, &clock, identity, &client_reg_start.message.serialize())
            .unwrap();
        let reg_response =
            opaque_ke::RegistrationResponse::<DarkAuthCipherSuite>::deserialize(&reg_response_bytes).unwrap();
        let client_reg_finish = client_reg_start
            .state
            .finish(
                &mut OsRng,
                password,
                reg_response,
                ClientRegistrationFinishParameters::default(),
            )
            .unwrap();
        engine
            .registration_finish(
                &store,
                &clock,
                &reg_session_id,
                identity,
                identity,
                &client_reg_finish.message.serialize(),
            )
            .unwrap();

        let client_login_start = opaque_ke::ClientLogin::<DarkAuthCipherSuite>::start(&mut OsRng, password).unwrap();
        let (session_id, login_response_bytes) = engine
            .login_start(&store, &clock, identity, &client_login_start.message.serialize())
            .unwrap();
        let login_response =
            opaque_ke::CredentialResponse::<DarkAuthCipherSuite>::deserialize(&login_response_bytes).unwrap();
        let client_login_finish = client_login_start
            .state
            .finish(password, login_response, ClientLoginFinishParameters::default())
            .unwrap();

        let session_key = engine
            .login_finish(&store, &session_id, &client_login_finish.message.serialize())
            .unwrap();
        assert!(session_key.is_some());
    }

    #[test]
    fn registration_finish_rejects_a_session_bound_to_a_different_identity() {
        let (store, _kek, engine) = engine();
        let clock = SystemClock;
        let password = b"correct horse battery staple";

        let client_reg_start = ClientRegistration::<DarkAuthCipherSuite>::start(&mut OsRng, password).unwrap();
        let (session_id, reg_response_bytes) = engine
            .registration_start(&store, &clock, "alice@example.com", &client_reg_start.message.serialize())
            .unwrap();
        let reg_response =
            opaque_ke::RegistrationResponse::<DarkAuthCipherSuite>::deserialize(&reg_response_bytes).unwrap();
        let client_reg_finish = client_reg_start
            .state
            .finish(
                &mut OsRng,
                password,
                reg_response,
                ClientRegistrationFinishParameters::default(),
            )
            .unwrap();

        let result = engine.registration_finish(
            &store,
            &clock,
            &session_id,
            "mallory@example.com",
            "mallory@example.com",
            &client_reg_finish.message.serialize(),
        );
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[test]
    fn login_against_unknown_identity_does_not_error_before_finish() {
        let (store, _kek, engine) = engine();
        let clock = SystemClock;
        let password = b"whatever";
        let client_login_start = opaque_ke::ClientLogin::<DarkAuthCipherSuite>::start(&mut OsRng, password).unwrap();
        let result = engine.login_start(&store, &clock, "nobody@example.com", &client_login_start.message.serialize());
        assert!(result.is_ok());
    }
}
