//! Same-origin, CSRF, and install-gate enforcement layers, generalizing
//! the teacher's `server/http_layers/rate_limit.rs` middleware-fn
//! pattern (`async fn(..., Request<Body>, Next) -> impl IntoResponse`)
//! to section 4.D's request-shape invariants.

use crate::http::state::AppState;
use crate::oidc;
use crate::session::{csrf_is_satisfied, is_same_origin, SessionCookieName};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;

/// Rejects state-changing requests whose `Sec-Fetch-Site`/`Origin`/
/// `Referer` don't match the configured public origin, before the
/// request reaches any handler (section 6 "Headers required").
pub async fn require_same_origin(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    if !is_same_origin(&parts, &state.config.public_origin) {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

/// Double-submit CSRF check for the user session cookie pair (section
/// 4.D, testable property 5: a POST with a valid session cookie but no
/// matching `x-csrf-token` header is rejected before business logic).
pub async fn require_user_csrf(request: Request<Body>, next: Next) -> Response {
    require_csrf(SessionCookieName::User, request, next).await
}

pub async fn require_admin_csrf(request: Request<Body>, next: Next) -> Response {
    require_csrf(SessionCookieName::Admin, request, next).await
}

async fn require_csrf(which: SessionCookieName, request: Request<Body>, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let jar = CookieJar::from_headers(&parts.headers);
    if jar.get(which.session_cookie()).is_some() && !csrf_is_satisfied(&parts, &jar, which) {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

/// Hides `/install/*` once the system has been initialized, and hides
/// every other route until it has (section 4.E install gate).
pub async fn require_uninitialized(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    match oidc::is_system_initialized(state.store.as_ref()) {
        Ok(true) => StatusCode::NOT_FOUND.into_response(),
        Ok(false) => next.run(request).await,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn require_initialized(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    match oidc::is_system_initialized(state.store.as_ref()) {
        Ok(true) => next.run(request).await,
        Ok(false) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
