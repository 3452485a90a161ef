//! `/install/*` (section 4.E "Install gate"). Only reachable before the
//! first admin identity exists; the install-gate middleware
//! (`crate::http::middleware::require_uninitialized`) hides these routes
//! once `oidc::is_system_initialized` flips true.

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::http::state::AppState;
use crate::oidc;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

fn check_token(state: &AppState, presented: &str) -> AppResult<()> {
    let guard = state.install_gate.read().map_err(|_| AppError::Internal)?;
    match guard.as_ref() {
        Some(gate) if gate.check(presented) => Ok(()),
        _ => Err(AppError::Forbidden),
    }
}

#[derive(Deserialize)]
pub struct OpaqueStartRequest {
    pub install_token: String,
    pub identity: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct OpaqueStartResponse {
    pub session_id: String,
    pub message: String,
}

pub async fn opaque_start(
    State(state): State<AppState>,
    Json(body): Json<OpaqueStartRequest>,
) -> AppResult<Json<OpaqueStartResponse>> {
    check_token(&state, &body.install_token)?;
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
    Ok(Json(OpaqueStartResponse {
        session_id,
        message: crypto::b64u_encode(&response_bytes),
    }))
}

#[derive(Deserialize)]
pub struct OpaqueFinishRequest {
    pub install_token: String,
    pub identity: String,
    pub session_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct OpaqueFinishResponse {
    pub admin_sub: String,
}

pub async fn opaque_finish(
    State(state): State<AppState>,
    Json(body): Json<OpaqueFinishRequest>,
) -> AppResult<Json<OpaqueFinishResponse>> {
    check_token(&state, &body.install_token)?;
    let upload_bytes = crypto::b64u_decode(&body.message)?;
    let state_clone = state.clone();

    let admin_sub = tokio::task::spawn_blocking(move || -> AppResult<String> {
        let sub = uuid::Uuid::new_v4().to_string();
        if state_clone.store.user_get_by_email(&body.identity)?.is_some() {
            return Err(AppError::Conflict("identity already registered".to_string()));
        }
        state_clone.store.user_create(crate::store::UserRow {
            sub: sub.clone(),
            email: body.identity.clone(),
            display_name: Some("Administrator".to_string()),
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
        )?;
        Ok(sub)
    })
    .await
    .map_err(|_| AppError::Internal)??;

    Ok(Json(OpaqueFinishResponse { admin_sub }))
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub install_token: String,
    pub admin_sub: String,
}

pub async fn complete(State(state): State<AppState>, Json(body): Json<CompleteRequest>) -> AppResult<Json<serde_json::Value>> {
    check_token(&state, &body.install_token)?;
    oidc::complete_install(state.store.as_ref(), &body.admin_sub)?;
    let mut guard = state.install_gate.write().map_err(|_| AppError::Internal)?;
    *guard = None;
    Ok(Json(serde_json::json!({ "ok": true })))
}
