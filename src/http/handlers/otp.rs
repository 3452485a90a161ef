//! `/api/otp/*` step-up endpoints (section 6, section 4.F).

use crate::error::AppResult;
use crate::http::state::AppState;
use crate::otp;
use crate::session::UserSession;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct SetupInitResponse {
    pub secret_base32: String,
    pub provisioning_uri: String,
}

pub async fn setup_init(UserSession(session): UserSession) -> Json<SetupInitResponse> {
    let (secret_base32, provisioning_uri) = otp::setup_init(&session.row.user_sub);
    Json(SetupInitResponse {
        secret_base32,
        provisioning_uri,
    })
}

#[derive(Deserialize)]
pub struct SetupVerifyRequest {
    pub secret_base32: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct SetupVerifyResponse {
    pub success: bool,
}

pub async fn setup_verify(
    State(state): State<AppState>,
    UserSession(session): UserSession,
    Json(body): Json<SetupVerifyRequest>,
) -> AppResult<Json<SetupVerifyResponse>> {
    let now = state.clock.unix_seconds();
    let success = otp::setup_verify(
        state.store.as_ref(),
        &session.row.user_sub,
        &body.secret_base32,
        now,
        &body.code,
    )?;
    Ok(Json(SetupVerifyResponse { success }))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub code: String,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    pub success: bool,
}

/// `/api/otp/verify`: a step-up code check that, on success, marks the
/// current session OTP-elevated (section 4.F: "a session becomes
/// OTP-elevated only after a successful verify"), unblocking `/consent`
/// for users under an OTP-required policy.
pub async fn verify(
    State(state): State<AppState>,
    UserSession(session): UserSession,
    Json(body): Json<VerifyRequest>,
) -> AppResult<Json<VerifyResponse>> {
    let now = state.clock.unix_seconds();
    crate::ratelimit::check_identity_rate_limit(
        state.store.as_ref(),
        "otp_verify",
        &session.row.user_sub,
        now,
        crate::ratelimit::IDENTITY_OTP_MAX_PER_WINDOW,
    )?;
    let success = otp::verify(state.store.as_ref(), &session.row.user_sub, now, &body.code)?;
    if success {
        state.store.session_mark_otp_elevated(&session.row.session_id)?;
    }
    Ok(Json(VerifyResponse { success }))
}

/// `/api/otp/reauth`: re-proves OTP possession for an already-elevated
/// session (e.g. before a sensitive admin action) without requiring a
/// fresh login.
pub async fn reauth(
    State(state): State<AppState>,
    UserSession(session): UserSession,
    Json(body): Json<VerifyRequest>,
) -> AppResult<Json<VerifyResponse>> {
    let now = state.clock.unix_seconds();
    crate::ratelimit::check_identity_rate_limit(
        state.store.as_ref(),
        "otp_verify",
        &session.row.user_sub,
        now,
        crate::ratelimit::IDENTITY_OTP_MAX_PER_WINDOW,
    )?;
    let success = otp::verify(state.store.as_ref(), &session.row.user_sub, now, &body.code)?;
    if success {
        state.store.session_mark_otp_elevated(&session.row.session_id)?;
    }
    Ok(Json(VerifyResponse { success }))
}

pub async fn disable(State(state): State<AppState>, UserSession(session): UserSession) -> AppResult<Json<serde_json::Value>> {
    otp::disable(state.store.as_ref(), &session.row.user_sub)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
