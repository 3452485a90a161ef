//! OTP step-up policy engine (section 4.F). TOTP (RFC 6238) via
//! `totp-rs`, with a manual `lastUsedStep` replay guard since the crate
//! only checks code validity, not prior use, and backup codes that are
//! single-use by construction (section 3 `otp_record`).

use crate::crypto;
use crate::error::AppError;
use crate::store::{GroupRow, OtpRecordRow, RoleRow, Store};
use totp_rs::{Algorithm, Secret, TOTP};

const TOTP_STEP_SECS: u64 = 30;
const TOTP_SKEW_STEPS: i64 = 1;
const BACKUP_CODE_COUNT: usize = 10;

fn totp_for_secret(secret_base32: &str) -> Result<TOTP, AppError> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|_| AppError::Crypto)?;
    TOTP::new(Algorithm::SHA1, 6, 1, TOTP_STEP_SECS, secret, None, String::new())
        .map_err(|_| AppError::Crypto)
}

/// Begins enrollment: generates a fresh secret and leaves it unverified
/// until the caller proves possession with `setup_verify` (section 4.F).
pub fn setup_init(identity: &str) -> (String, String) {
    let secret_bytes = crypto::random_bytes_vec(20);
    let secret_base32 = Secret::Raw(secret_bytes).to_encoded().to_string();
    let totp = totp_for_secret(&secret_base32).expect("freshly generated secret is always valid");
    let otpauth_uri = totp.get_url();
    let _ = identity;
    (secret_base32, otpauth_uri)
}

pub fn setup_verify(
    store: &dyn Store,
    identity: &str,
    secret_base32: &str,
    now_unix: i64,
    code: &str,
) -> Result<bool, AppError> {
    let totp = totp_for_secret(secret_base32)?;
    let step = current_step(now_unix);
    if !code_matches_any_step(&totp, code, step) {
        return Ok(false);
    }
    let backup_codes = generate_backup_codes();
    let backup_code_hashes = backup_codes
        .iter()
        .map(|code| crypto::sha256(code.as_bytes()).to_vec())
        .collect();
    store.otp_upsert(OtpRecordRow {
        identity: identity.to_string(),
        secret_base32: secret_base32.to_string(),
        verified: true,
        last_used_step: step,
        backup_code_hashes,
    })?;
    Ok(true)
}

/// Verifies a step-up code, enforcing the replay guard: a step at or
/// before `lastUsedStep` is rejected even if numerically correct (section
/// 4.F invariant, section 8 testable property 7). Falls back to
/// single-use backup codes when the 6-digit TOTP code doesn't parse as a
/// time-based code (section 3 `otp_record.backup_code_hashes`).
pub fn verify(store: &dyn Store, identity: &str, now_unix: i64, code: &str) -> Result<bool, AppError> {
    let Some(record) = store.otp_get(identity)? else {
        return Ok(false);
    };
    if !record.verified {
        return Ok(false);
    }

    if code.len() == 6 && code.chars().all(|c| c.is_ascii_digit()) {
        let totp = totp_for_secret(&record.secret_base32)?;
        let step = current_step(now_unix);
        if step > record.last_used_step && code_matches_any_step(&totp, code, step) {
            let mut updated = record;
            updated.last_used_step = step;
            store.otp_upsert(updated)?;
            return Ok(true);
        }
        return Ok(false);
    }

    let code_hash = crypto::sha256(code.as_bytes());
    store.otp_consume_backup_code(identity, &code_hash)
}

pub fn disable(store: &dyn Store, identity: &str) -> Result<(), AppError> {
    store.otp_delete(identity)
}

fn current_step(now_unix: i64) -> i64 {
    now_unix / TOTP_STEP_SECS as i64
}

fn code_matches_any_step(totp: &TOTP, code: &str, step: i64) -> bool {
    (-TOTP_SKEW_STEPS..=TOTP_SKEW_STEPS).any(|skew| {
        let candidate_step = step + skew;
        if candidate_step < 0 {
            return false;
        }
        let unix_time = candidate_step as u64 * TOTP_STEP_SECS;
        totp.generate(unix_time) == code
    })
}

fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let bytes = crypto::random_bytes::<5>();
            let encoded = crypto::b64u_encode(&bytes).to_uppercase();
            format!("{}-{}", &encoded[..4], &encoded[4..8.min(encoded.len())])
        })
        .collect()
}

/// Whether the acting identity must complete OTP step-up before an
/// operation proceeds: any bound group or role with `requireOtp` forces
/// it, independent of whether OTP is otherwise optional (section 4.F
/// `EffectivePolicy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub otp_required: bool,
}

impl EffectivePolicy {
    pub fn compute(groups: &[GroupRow], roles: &[RoleRow]) -> Self {
        let otp_required = groups.iter().filter(|g| g.enable_login).any(|g| g.require_otp)
            || roles.iter().any(|r| r.require_otp);
        EffectivePolicy { otp_required }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    #[test]
    fn setup_verify_accepts_correct_code_and_rejects_wrong_one() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (secret, _) = setup_init("user@example.com");
        let totp = totp_for_secret(&secret).unwrap();
        let now = 1_700_000_000i64;
        let correct_code = totp.generate(now as u64);
        let wrong_code = if correct_code == "000000" { "111111" } else { "000000" };

        assert!(!setup_verify(&store, "user@example.com", &secret, now, wrong_code).unwrap());
        assert!(setup_verify(&store, "user@example.com", &secret, now, &correct_code).unwrap());
    }

    #[test]
    fn verify_rejects_replayed_step() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (secret, _) = setup_init("user@example.com");
        let totp = totp_for_secret(&secret).unwrap();
        let now = 1_700_000_000i64;
        let code = totp.generate(now as u64);
        assert!(setup_verify(&store, "user@example.com", &secret, now, &code).unwrap());

        // Replaying the same step after verification must fail.
        assert!(!verify(&store, "user@example.com", now, &code).unwrap());
    }

    #[test]
    fn effective_policy_requires_otp_if_any_group_or_role_does() {
        let groups = vec![GroupRow {
            name: "admins".to_string(),
            enable_login: true,
            require_otp: true,
        }];
        let roles = vec![];
        assert!(EffectivePolicy::compute(&groups, &roles).otp_required);
    }

    #[test]
    fn effective_policy_ignores_require_otp_on_a_login_disabled_group() {
        let groups = vec![GroupRow {
            name: "stale-admins".to_string(),
            enable_login: false,
            require_otp: true,
        }];
        let roles = vec![];
        assert!(!EffectivePolicy::compute(&groups, &roles).otp_required);
    }
}
