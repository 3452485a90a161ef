//! `/authorize`, `/consent`, `/token`, and discovery endpoints (section
//! 6 user surface, section 4.E).

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::http::state::AppState;
use crate::oidc::{self, token, AuthorizeRequest, TokenRequest};
use crate::session::UserSession;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

pub async fn authorize(
    State(state): State<AppState>,
    session: Option<UserSession>,
    Query(req): Query<AuthorizeRequest>,
) -> AppResult<Response> {
    let bound_user_sub = session.as_ref().map(|s| s.0.row.user_sub.as_str());
    let pending = oidc::authorize_start(state.store.as_ref(), state.clock.as_ref(), &req, bound_user_sub)?;
    Ok(Redirect::to(&format!("/consent?request_id={}", pending.request_id)).into_response())
}

#[derive(Deserialize)]
pub struct ConsentBody {
    pub request_id: String,
    pub scope: Option<String>,
}

pub async fn consent(
    State(state): State<AppState>,
    UserSession(session): UserSession,
    Json(body): Json<ConsentBody>,
) -> AppResult<Json<serde_json::Value>> {
    let requested: Option<Vec<String>> = body
        .scope
        .map(|s| s.split_whitespace().map(|s| s.to_string()).collect());
    let result = oidc::consent(
        state.store.as_ref(),
        state.clock.as_ref(),
        &body.request_id,
        &session.row.user_sub,
        session.row.otp_elevated,
        requested.as_deref(),
    )?;

    let mut redirect = url::Url::parse(&result.redirect_uri).map_err(|_| AppError::Internal)?;
    redirect.query_pairs_mut().append_pair("code", &result.code);
    if let Some(state_param) = &result.state {
        redirect.query_pairs_mut().append_pair("state", state_param);
    }
    Ok(Json(serde_json::json!({ "redirect": redirect.to_string() })))
}

fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub async fn token(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<TokenRequest>,
) -> AppResult<Json<oidc::TokenResponse>> {
    if req.grant_type != "authorization_code" {
        return Err(AppError::InvalidRequest("unsupported grant_type".to_string()));
    }

    let basic_auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth);

    let code_bytes = crypto::b64u_decode(&req.code)?;
    let code_hash = crypto::sha256(&code_bytes).to_vec();
    let code_row = state
        .store
        .code_consume(&code_hash)?
        .ok_or(AppError::InvalidGrant("code is unknown, expired, or already used".to_string()))?;
    if code_row.expires_at <= state.clock.unix_seconds() {
        return Err(AppError::InvalidGrant("code has expired".to_string()));
    }

    let pending = state
        .store
        .pending_auth_consume(&code_row.request_id)?
        .ok_or(AppError::InvalidGrant("pending authorization is gone".to_string()))?;
    if pending.redirect_uri != req.redirect_uri {
        return Err(AppError::InvalidRequest("redirect_uri mismatch".to_string()));
    }

    let client_id = req
        .client_id
        .clone()
        .or_else(|| basic_auth.as_ref().map(|(u, _)| u.clone()))
        .unwrap_or_else(|| pending.client_id.clone());
    let client = state.store.client_get(&client_id)?.ok_or(AppError::InvalidClient)?;

    let presented_secret = req
        .client_secret
        .as_deref()
        .or_else(|| basic_auth.as_ref().map(|(_, p)| p.as_str()));
    oidc::authenticate_client(&state.kek, &client, presented_secret)?;

    oidc::verify_pkce(&pending, req.code_verifier.as_deref())?;

    let user = state.store.user_get_by_sub(&code_row.user_sub)?.ok_or(AppError::Internal)?;
    let groups = state.store.user_groups(&user.sub)?;
    let roles = state.store.user_roles(&user.sub)?;

    let now = state.clock.unix_seconds();
    let claims = token::build_claims(&token::TokenMintParams {
        issuer: &state.config.issuer,
        client_id: &client.client_id,
        user: &user,
        groups: &groups,
        roles: &roles,
        otp_elevated: pending.otp_elevated,
        nonce: pending.nonce.clone(),
        issued_at: now,
        ttl_secs: state.config.access_token_ttl_secs,
    });
    let id_token = token::sign(&state.signing_keys, &claims)?;
    let access_token = token::mint_access_token();

    let drk_jwe = match (&pending.zk_pub_jwk, &user.wrapped_drk) {
        (Some(jwk_json), Some(wrapped_drk)) => {
            let recipient = crypto::validate_p256_public_jwk(jwk_json)?;
            let drk_plaintext = state.kek.unwrap(wrapped_drk)?;
            Some(oidc::drk_jwe::seal(&recipient, &drk_plaintext)?)
        }
        _ => None,
    };

    Ok(Json(oidc::TokenResponse {
        access_token,
        id_token,
        token_type: "Bearer",
        expires_in: state.config.access_token_ttl_secs,
        drk_jwe,
    }))
}

pub async fn discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(oidc::discovery_document(&state.config.issuer))
}

pub async fn jwks(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    Ok(Json(crate::kek::jwks(state.store.as_ref())?))
}
