//! Persistence contract (section 4.G) and the section 3 data model.
//! Generalizes the teacher's trait-splitting pattern
//! (`user/user_store.rs`'s `UserAuthCredentialsStore`/`UserAuthTokenStore`
//! supertraits) to every entity the core needs. `sqlite` is the sole
//! implementation (SPEC_FULL.md section 3.G).

pub mod sqlite;

use crate::error::AppError;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Data model (section 3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub sub: String,
    pub email: String,
    pub display_name: Option<String>,
    pub wrapped_drk: Option<Vec<u8>>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct OpaqueRecordRow {
    pub sub: String,
    pub envelope: Vec<u8>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientKind {
    Public,
    Confidential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZkDelivery {
    None,
    FragmentJwe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    pub key: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRow {
    pub client_id: String,
    pub kind: ClientKind,
    pub redirect_uris: Vec<String>,
    pub post_logout_redirect_uris: Vec<String>,
    pub require_pkce: bool,
    pub zk_delivery: ZkDelivery,
    pub zk_required: bool,
    pub token_endpoint_auth_method: String,
    pub encrypted_secret: Option<Vec<u8>>,
    pub allowed_scopes: Vec<ScopeDescriptor>,
    pub allowed_zk_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SigningKeyRow {
    pub kid: String,
    pub wrapped_private_key: Vec<u8>,
    pub public_jwk: String,
    pub created_at: i64,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct PendingAuthRow {
    pub request_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub zk_pub_kid: Option<String>,
    /// The validated `zk_pub` JWK, verbatim, so `/token` can re-derive the
    /// DRK-JWE recipient key without re-trusting client input a second
    /// time (section 4.E step 7). `zk_pub_kid` alone is a digest and
    /// cannot be inverted back into a key.
    pub zk_pub_jwk: Option<String>,
    pub user_sub: Option<String>,
    pub otp_elevated: bool,
    pub origin: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct AuthorizationCodeRow {
    pub code_hash: Vec<u8>,
    pub request_id: String,
    pub user_sub: String,
    pub scope: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDomain {
    User,
    Admin,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub domain: SessionDomain,
    pub user_sub: String,
    pub csrf_token: String,
    pub otp_elevated: bool,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct OtpRecordRow {
    pub identity: String,
    pub secret_base32: String,
    pub verified: bool,
    pub last_used_step: i64,
    pub backup_code_hashes: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub name: String,
    pub enable_login: bool,
    pub require_otp: bool,
}

#[derive(Debug, Clone)]
pub struct RoleRow {
    pub name: String,
    pub require_otp: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: Option<String>,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub timestamp: i64,
    pub outcome: AuditOutcome,
    pub details: serde_json::Value,
}

// ---------------------------------------------------------------------
// Repository traits (section 4.G)
// ---------------------------------------------------------------------

pub trait UserRepository: Send + Sync {
    fn user_get_by_sub(&self, sub: &str) -> Result<Option<UserRow>, AppError>;
    fn user_get_by_email(&self, email: &str) -> Result<Option<UserRow>, AppError>;
    fn user_create(&self, user: UserRow) -> Result<(), AppError>;
    fn user_update(&self, user: UserRow) -> Result<(), AppError>;
    fn user_delete(&self, sub: &str) -> Result<(), AppError>;
    fn user_groups(&self, sub: &str) -> Result<Vec<GroupRow>, AppError>;
    fn user_roles(&self, sub: &str) -> Result<Vec<RoleRow>, AppError>;
}

pub trait OpaqueRecordRepository: Send + Sync {
    fn opaque_record_get(&self, sub: &str) -> Result<Option<OpaqueRecordRow>, AppError>;
    fn opaque_record_upsert(&self, record: OpaqueRecordRow) -> Result<(), AppError>;
    fn opaque_record_delete(&self, sub: &str) -> Result<(), AppError>;
}

pub trait ClientRepository: Send + Sync {
    fn client_get(&self, client_id: &str) -> Result<Option<ClientRow>, AppError>;
    fn client_list(&self) -> Result<Vec<ClientRow>, AppError>;
    fn client_upsert(&self, client: ClientRow) -> Result<(), AppError>;
    fn client_delete(&self, client_id: &str) -> Result<(), AppError>;
}

pub trait SigningKeyRepository: Send + Sync {
    fn signing_keys_get_active(&self) -> Result<Option<SigningKeyRow>, AppError>;
    fn signing_keys_list_non_retired(&self) -> Result<Vec<SigningKeyRow>, AppError>;
    fn signing_keys_list_all(&self) -> Result<Vec<SigningKeyRow>, AppError>;
    fn signing_keys_insert(&self, key: SigningKeyRow) -> Result<(), AppError>;
    fn signing_keys_retire(&self, kid: &str) -> Result<(), AppError>;
}

pub trait PendingAuthRepository: Send + Sync {
    fn pending_auth_create(&self, row: PendingAuthRow) -> Result<(), AppError>;
    fn pending_auth_get(&self, request_id: &str) -> Result<Option<PendingAuthRow>, AppError>;
    fn pending_auth_bind_subject(&self, request_id: &str, sub: &str) -> Result<(), AppError>;
    fn pending_auth_set_otp_elevated(&self, request_id: &str) -> Result<(), AppError>;
    fn pending_auth_consume(&self, request_id: &str) -> Result<Option<PendingAuthRow>, AppError>;
    fn pending_auth_sweep_expired(&self, now: i64) -> Result<u64, AppError>;
}

pub trait CodeRepository: Send + Sync {
    fn code_create(&self, row: AuthorizationCodeRow) -> Result<(), AppError>;
    fn code_consume(&self, code_hash: &[u8]) -> Result<Option<AuthorizationCodeRow>, AppError>;
    fn code_sweep_expired(&self, now: i64) -> Result<u64, AppError>;
}

pub trait SessionRepository: Send + Sync {
    fn session_create(&self, row: SessionRow) -> Result<(), AppError>;
    fn session_get(&self, session_id: &str) -> Result<Option<SessionRow>, AppError>;
    fn session_touch(&self, session_id: &str, last_seen_at: i64) -> Result<(), AppError>;
    fn session_delete(&self, session_id: &str) -> Result<(), AppError>;
    fn session_mark_otp_elevated(&self, session_id: &str) -> Result<(), AppError>;
}

/// Transient OPAQUE session state, serialized at rest (section 4.C /
/// 4.G). The store treats the payload as opaque bytes; `OpaqueEngine`
/// owns the serialization format.
pub trait OpaqueTransientSessionRepository: Send + Sync {
    fn opaque_session_create(
        &self,
        session_id: &str,
        state: Vec<u8>,
        expires_at: i64,
    ) -> Result<(), AppError>;
    fn opaque_session_take(&self, session_id: &str) -> Result<Option<Vec<u8>>, AppError>;
    fn opaque_session_sweep_expired(&self, now: i64) -> Result<u64, AppError>;
}

pub trait OtpRepository: Send + Sync {
    fn otp_get(&self, identity: &str) -> Result<Option<OtpRecordRow>, AppError>;
    fn otp_upsert(&self, record: OtpRecordRow) -> Result<(), AppError>;
    fn otp_delete(&self, identity: &str) -> Result<(), AppError>;
    fn otp_consume_backup_code(
        &self,
        identity: &str,
        code_hash: &[u8],
    ) -> Result<bool, AppError>;
}

pub trait SettingsRepository: Send + Sync {
    fn settings_get(&self, key: &str) -> Result<Option<String>, AppError>;
    fn settings_set(&self, key: &str, value: &str) -> Result<(), AppError>;
    fn settings_list(&self) -> Result<Vec<(String, String)>, AppError>;
}

pub trait AuditRepository: Send + Sync {
    fn audit_write(&self, entry: AuditEntry) -> Result<(), AppError>;
}

/// Per-identity brute-force counters (section 5: "rate-limited per IP
/// and per identity"), a fixed-window `incr(key, window) → count`
/// contract distinct from the per-IP `tower_governor` layers.
pub trait RateLimitRepository: Send + Sync {
    fn rate_limit_incr(&self, key: &str, now: i64, window_secs: i64) -> Result<i64, AppError>;
}

/// The union of every repository the HTTP layer depends on. Matches the
/// teacher's `UserStore: UserAuthTokenStore + UserAuthCredentialsStore`
/// supertrait pattern, generalized to all of section 4.G.
pub trait Store:
    UserRepository
    + OpaqueRecordRepository
    + ClientRepository
    + SigningKeyRepository
    + PendingAuthRepository
    + CodeRepository
    + SessionRepository
    + OpaqueTransientSessionRepository
    + OtpRepository
    + SettingsRepository
    + AuditRepository
    + RateLimitRepository
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: UserRepository
        + OpaqueRecordRepository
        + ClientRepository
        + SigningKeyRepository
        + PendingAuthRepository
        + CodeRepository
        + SessionRepository
        + OpaqueTransientSessionRepository
        + OtpRepository
        + SettingsRepository
        + AuditRepository
        + RateLimitRepository
        + Send
        + Sync
{
}
