//! Admin surface: mirrors OPAQUE login on its own path prefix and the
//! admin session status/logout pair (section 6, "admin surface mirrors
//! OPAQUE login on its own path prefix").

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::http::state::AppState;
use crate::session::{expire_cookie, AdminSession, SessionCookieName};
use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct LoginStartRequest {
    pub identity: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct LoginStartResponse {
    pub session_id: String,
    pub message: String,
}

pub async fn login_start(
    State(state): State<AppState>,
    Json(body): Json<LoginStartRequest>,
) -> AppResult<Json<LoginStartResponse>> {
    crate::ratelimit::check_identity_rate_limit(
        state.store.as_ref(),
        "admin_login",
        &body.identity,
        state.clock.unix_seconds(),
        crate::ratelimit::IDENTITY_LOGIN_MAX_PER_WINDOW,
    )?;
    let request_bytes = crypto::b64u_decode(&body.message)?;
    let state_clone = state.clone();
    let (session_id, response_bytes) = tokio::task::spawn_blocking(move || {
        state_clone
            .opaque
            .login_start(state_clone.store.as_ref(), state_clone.clock.as_ref(), &body.identity, &request_bytes)
    })
    .await
    .map_err(|_| AppError::Internal)??;

    Ok(Json(LoginStartResponse {
        session_id,
        message: crypto::b64u_encode(&response_bytes),
    }))
}

#[derive(Deserialize)]
pub struct LoginFinishRequest {
    pub identity: String,
    pub session_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct LoginFinishResponse {
    pub otp_required: bool,
}

pub async fn login_finish(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginFinishRequest>,
) -> AppResult<(CookieJar, Json<LoginFinishResponse>)> {
    let finalization_bytes = crypto::b64u_decode(&body.message)?;
    let state_clone = state.clone();
    let session_id = body.session_id.clone();
    let session_key = tokio::task::spawn_blocking(move || {
        state_clone
            .opaque
            .login_finish(state_clone.store.as_ref(), &session_id, &finalization_bytes)
    })
    .await
    .map_err(|_| AppError::Internal)??;

    if session_key.is_none() {
        return Err(AppError::Unauthorized);
    }

    let user = state
        .store
        .user_get_by_email(&body.identity)?
        .ok_or(AppError::Unauthorized)?;
    let otp_required = crate::oidc::effective_otp_policy(state.store.as_ref(), &user.sub)?.otp_required;

    let session_row_id = uuid::Uuid::new_v4().to_string();
    let csrf_token = crypto::b64u_encode(&crypto::random_bytes::<24>());
    let now = state.clock.unix_seconds();
    state.store.session_create(crate::store::SessionRow {
        session_id: session_row_id.clone(),
        domain: crate::store::SessionDomain::Admin,
        user_sub: user.sub,
        csrf_token: csrf_token.clone(),
        otp_elevated: false,
        created_at: now,
        last_seen_at: now,
        expires_at: now + state.config.session_ttl_secs,
    })?;

    let (session_cookie, csrf_cookie) = crate::session::session_cookies(
        SessionCookieName::Admin,
        &session_row_id,
        &csrf_token,
        time::Duration::seconds(state.config.session_ttl_secs),
        !state.config.is_development,
    );
    let jar = jar.add(session_cookie).add(csrf_cookie);

    Ok((jar, Json(LoginFinishResponse { otp_required })))
}

#[derive(Serialize)]
pub struct SessionStatusResponse {
    pub authenticated: bool,
    pub user_sub: String,
    pub otp_elevated: bool,
    pub expires_at: i64,
}

pub async fn status(AdminSession(session): AdminSession) -> Json<SessionStatusResponse> {
    Json(SessionStatusResponse {
        authenticated: true,
        user_sub: session.row.user_sub,
        otp_elevated: session.row.otp_elevated,
        expires_at: session.row.expires_at,
    })
}

pub async fn logout(
    State(state): State<AppState>,
    AdminSession(session): AdminSession,
    jar: CookieJar,
) -> (CookieJar, Json<serde_json::Value>) {
    let _ = state.store.session_delete(&session.row.session_id);
    let jar = jar
        .add(expire_cookie(SessionCookieName::Admin.session_cookie()))
        .add(expire_cookie(SessionCookieName::Admin.csrf_cookie()));
    (jar, Json(serde_json::json!({ "ok": true })))
}
