//! Router assembly (section 3.I), generalizing the teacher's
//! `server/server.rs` `Router::new().route(path, get(..)).with_state(state)`
//! style to every endpoint in section 6 plus the admin-surface mirror,
//! `/install/*`, and `/openapi`.

pub mod handlers;
pub mod middleware;
pub mod state;

use crate::ratelimit;
use axum::middleware::from_fn;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use state::AppState;

fn openapi_document() -> serde_json::Value {
    serde_json::json!({
        "openapi": "3.0.3",
        "info": { "title": "DarkAuth Core", "version": "1" },
        "paths": {
            "/api/user/opaque/register/start": {"post": {}},
            "/api/user/opaque/register/finish": {"post": {}},
            "/api/user/opaque/login/start": {"post": {}},
            "/api/user/opaque/login/finish": {"post": {}},
            "/authorize": {"get": {}},
            "/consent": {"post": {}},
            "/token": {"post": {}},
            "/.well-known/openid-configuration": {"get": {}},
            "/.well-known/jwks.json": {"get": {}},
            "/api/otp/setup/init": {"post": {}},
            "/api/otp/setup/verify": {"post": {}},
            "/api/otp/verify": {"post": {}},
            "/api/otp/reauth": {"post": {}},
            "/api/session": {"get": {}},
            "/logout": {"post": {}},
            "/install/opaque/start": {"post": {}},
            "/install/opaque/finish": {"post": {}},
            "/install/complete": {"post": {}},
        }
    })
}

async fn openapi() -> axum::Json<serde_json::Value> {
    axum::Json(openapi_document())
}

/// The user-facing surface (section 6's endpoint table).
pub fn user_router(state: AppState) -> Router {
    let opaque_routes = Router::new()
        .route("/api/user/opaque/register/start", post(handlers::opaque::register_start))
        .route("/api/user/opaque/register/finish", post(handlers::opaque::register_finish))
        .route("/api/user/opaque/login/start", post(handlers::opaque::login_start))
        .route("/api/user/opaque/login/finish", post(handlers::opaque::login_finish))
        .layer(ratelimit::governor_layer(ratelimit::OPAQUE_LOGIN_PER_MINUTE));

    let otp_routes = Router::new()
        .route("/api/otp/setup/init", post(handlers::otp::setup_init))
        .route("/api/otp/setup/verify", post(handlers::otp::setup_verify))
        .route("/api/otp/verify", post(handlers::otp::verify))
        .route("/api/otp/reauth", post(handlers::otp::reauth))
        .route("/api/otp/disable", post(handlers::otp::disable))
        .layer(ratelimit::governor_layer(ratelimit::OTP_VERIFY_PER_MINUTE))
        .layer(from_fn(middleware::require_user_csrf));

    let token_routes = Router::new()
        .route("/token", post(handlers::oidc::token))
        .layer(ratelimit::governor_layer(ratelimit::TOKEN_PER_MINUTE));

    let oidc_routes = Router::new()
        .route("/authorize", get(handlers::oidc::authorize))
        .route("/consent", post(handlers::oidc::consent))
        .merge(token_routes)
        .route("/.well-known/openid-configuration", get(handlers::oidc::discovery))
        .route("/.well-known/jwks.json", get(handlers::oidc::jwks))
        .layer(from_fn(middleware::require_user_csrf));

    let session_routes = Router::new()
        .route("/api/session", get(handlers::session::status))
        .route("/logout", post(handlers::session::logout))
        .layer(from_fn(middleware::require_user_csrf));

    let install_routes = Router::new()
        .route("/install/opaque/start", post(handlers::install::opaque_start))
        .route("/install/opaque/finish", post(handlers::install::opaque_finish))
        .route("/install/complete", post(handlers::install::complete))
        .layer(from_fn_with_state(state.clone(), middleware::require_uninitialized));

    let live_routes = Router::new()
        .merge(opaque_routes)
        .merge(otp_routes)
        .merge(oidc_routes)
        .merge(session_routes)
        .layer(from_fn_with_state(state.clone(), middleware::require_initialized));

    Router::new()
        .merge(live_routes)
        .merge(install_routes)
        .route("/openapi", get(openapi))
        .layer(from_fn_with_state(state.clone(), middleware::require_same_origin))
        .with_state(state)
}

/// The admin surface: OPAQUE login on its own path prefix plus session
/// status/logout (section 6, "admin surface mirrors OPAQUE login").
pub fn admin_router(state: AppState) -> Router {
    let login_routes = Router::new()
        .route("/api/admin/opaque/login/start", post(handlers::admin::login_start))
        .route("/api/admin/opaque/login/finish", post(handlers::admin::login_finish))
        .layer(ratelimit::governor_layer(ratelimit::OPAQUE_LOGIN_PER_MINUTE));

    let session_routes = Router::new()
        .route("/api/admin/session", get(handlers::admin::status))
        .route("/api/admin/logout", post(handlers::admin::logout))
        .layer(from_fn(middleware::require_admin_csrf));

    Router::new()
        .merge(login_routes)
        .merge(session_routes)
        .route("/openapi", get(openapi))
        .layer(from_fn_with_state(state.clone(), middleware::require_same_origin))
        .with_state(state)
}
