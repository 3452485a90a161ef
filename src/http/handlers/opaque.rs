//! OPAQUE registration/login endpoints (section 6 user surface).
//! Messages are base64url-encoded byte strings on the wire, per §6 "Wire
//! formats".

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::http::state::AppState;
use crate::oidc;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct RegisterStartRequest {
    pub identity: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct RegisterStartResponse {
    pub session_id: String,
    pub message: String,
}

pub async fn register_start(
    State(state): State<AppState>,
    Json(body): Json<RegisterStartRequest>,
) -> AppResult<Json<RegisterStartResponse>> {
    let request_bytes = crypto::b64u_decode(&body.message)?;
    let state_clone = state.clone();
    let (session_id, response_bytes) = tokio::task::spawn_blocking(move || {
        state_clone.opaque.registration_start(
            state_clone.store.as_ref(),
            state_clone.clock.as_ref(),
            &body.identity,
            &request_bytes,
        )
    })
    .await
    .map_err(|_| AppError::Internal)??;
    Ok(Json(RegisterStartResponse {
        session_id,
        message: crypto::b64u_encode(&response_bytes),
    }))
}

#[derive(Deserialize)]
pub struct RegisterFinishRequest {
    pub identity: String,
    pub session_id: String,
    pub message: String,
    pub display_name: Option<String>,
}

pub async fn register_finish(
    State(state): State<AppState>,
    Json(body): Json<RegisterFinishRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let upload_bytes = crypto::b64u_decode(&body.message)?;
    let state_clone = state.clone();

    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let sub = uuid::Uuid::new_v4().to_string();
        if state_clone.store.user_get_by_email(&body.identity)?.is_some() {
            return Err(AppError::Conflict("email already registered".to_string()));
        }
        state_clone.store.user_create(crate::store::UserRow {
            sub: sub.clone(),
            email: body.identity.clone(),
            display_name: body.display_name.clone(),
            wrapped_drk: None,
            created_at: state_clone.clock.unix_seconds(),
        })?;
        state_clone.opaque.registration_finish(
            state_clone.store.as_ref(),
            state_clone.clock.as_ref(),
            &body.session_id,
            &body.identity,
            &sub,
            &upload_bytes,
        )
    })
    .await
    .map_err(|_| AppError::Internal)??;

    Ok(Json(serde_json::json!({ "ok": true })))
}

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
        "user_login",
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
    pub access_token: String,
    pub otp_required: bool,
}

/// Completes login and establishes a user session (section 4.F: returns
/// `otpRequired=true` iff policy demands it and the session is not
/// already elevated).
pub async fn login_finish(
    State(state): State<AppState>,
    jar: axum_extra::extract::cookie::CookieJar,
    Json(body): Json<LoginFinishRequest>,
) -> AppResult<(axum_extra::extract::cookie::CookieJar, Json<LoginFinishResponse>)> {
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
    let otp_required = oidc::effective_otp_policy(state.store.as_ref(), &user.sub)?.otp_required;

    let access_token = crate::oidc::token::mint_access_token();
    let session_row_id = uuid::Uuid::new_v4().to_string();
    let csrf_token = crypto::b64u_encode(&crypto::random_bytes::<24>());
    let now = state.clock.unix_seconds();
    state.store.session_create(crate::store::SessionRow {
        session_id: session_row_id.clone(),
        domain: crate::store::SessionDomain::User,
        user_sub: user.sub,
        csrf_token: csrf_token.clone(),
        otp_elevated: false,
        created_at: now,
        last_seen_at: now,
        expires_at: now + state.config.session_ttl_secs,
    })?;

    let (session_cookie, csrf_cookie) = crate::session::session_cookies(
        crate::session::SessionCookieName::User,
        &session_row_id,
        &csrf_token,
        time::Duration::seconds(state.config.session_ttl_secs),
        !state.config.is_development,
    );
    let jar = jar.add(session_cookie).add(csrf_cookie);

    Ok((
        jar,
        Json(LoginFinishResponse {
            access_token,
            otp_required,
        }),
    ))
}
