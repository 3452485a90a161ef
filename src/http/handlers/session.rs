//! `GET /api/session` and `POST /logout` (section 6 user surface).

use crate::http::state::AppState;
use crate::session::{expire_cookie, SessionCookieName, UserSession};
use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;

#[derive(Serialize)]
pub struct SessionStatusResponse {
    pub authenticated: bool,
    pub user_sub: String,
    pub otp_elevated: bool,
    pub expires_at: i64,
}

pub async fn status(UserSession(session): UserSession) -> Json<SessionStatusResponse> {
    Json(SessionStatusResponse {
        authenticated: true,
        user_sub: session.row.user_sub,
        otp_elevated: session.row.otp_elevated,
        expires_at: session.row.expires_at,
    })
}

pub async fn logout(
    State(state): State<AppState>,
    UserSession(session): UserSession,
    jar: CookieJar,
) -> (CookieJar, Json<serde_json::Value>) {
    let _ = state.store.session_delete(&session.row.session_id);
    let jar = jar
        .add(expire_cookie(SessionCookieName::User.session_cookie()))
        .add(expire_cookie(SessionCookieName::User.csrf_cookie()));
    (jar, Json(serde_json::json!({ "ok": true })))
}
