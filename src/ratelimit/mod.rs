//! Rate limiting, generalizing the sibling
//! `catalog-server/src/server/http_layers/rate_limit.rs` `tower_governor`
//! setup (IP-keyed governor + custom error handler) to section 4.C/4.F's
//! brute-force surfaces: OPAQUE login, OTP verification, and the token
//! endpoint.

use crate::error::{AppError, AppResult};
use crate::store::Store;
use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::KeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tracing::warn;

/// OPAQUE login attempts per IP per minute (section 4.C brute-force note).
pub const OPAQUE_LOGIN_PER_MINUTE: u32 = 20;
/// OTP verification attempts per IP per minute (section 4.F brute-force note).
pub const OTP_VERIFY_PER_MINUTE: u32 = 20;
/// Token endpoint exchanges per IP per minute.
pub const TOKEN_PER_MINUTE: u32 = 60;

/// Width of the identity-keyed fixed window (section 5: "counters live
/// in a cache-like store whose contract is `incr(key, window)`").
pub const IDENTITY_WINDOW_SECS: i64 = 300;
/// OPAQUE login attempts per identity per window, on top of the
/// per-IP governor layers above.
pub const IDENTITY_LOGIN_MAX_PER_WINDOW: i64 = 10;
/// OTP verification/reauth attempts per identity per window.
pub const IDENTITY_OTP_MAX_PER_WINDOW: i64 = 10;

/// Per-identity brute-force guard, independent of the per-IP
/// `tower_governor` layers (section 5: "rate-limited per IP and per
/// identity"). `scope` namespaces the counter by endpoint family so a
/// login attempt and an OTP attempt against the same identity don't
/// share a bucket.
pub fn check_identity_rate_limit(
    store: &dyn Store,
    scope: &str,
    identity: &str,
    now: i64,
    max_per_window: i64,
) -> AppResult<()> {
    let key = format!("{scope}:{identity}");
    let count = store.rate_limit_incr(&key, now, IDENTITY_WINDOW_SECS)?;
    if count > max_per_window {
        return Err(AppError::RateLimited);
    }
    Ok(())
}

#[derive(Clone)]
pub struct IpKeyExtractor;

impl KeyExtractor for IpKeyExtractor {
    type Key = SocketAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}

pub fn governor_layer(per_minute: u32) -> GovernorLayer<IpKeyExtractor, tower_governor::governor::NoOpMiddleware> {
    let config: GovernorConfig<IpKeyExtractor, _> = GovernorConfigBuilder::default()
        .key_extractor(IpKeyExtractor)
        .period(std::time::Duration::from_secs(60) / per_minute.max(1))
        .burst_size(per_minute.max(1))
        .error_handler(rate_limit_error_handler)
        .finish()
        .expect("static governor configuration is always valid");
    GovernorLayer {
        config: Arc::new(config),
    }
}

fn rate_limit_error_handler(err: GovernorError) -> Response {
    match err {
        GovernorError::TooManyRequests { .. } => {
            warn!("rate limit exceeded");
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
        other => {
            warn!(?other, "rate limiting error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    #[test]
    fn governor_layer_builds_for_every_constant() {
        let _ = governor_layer(OPAQUE_LOGIN_PER_MINUTE);
        let _ = governor_layer(OTP_VERIFY_PER_MINUTE);
        let _ = governor_layer(TOKEN_PER_MINUTE);
    }

    #[test]
    fn identity_rate_limit_trips_after_the_configured_maximum() {
        let store = SqliteStore::open_in_memory().unwrap();
        for _ in 0..IDENTITY_LOGIN_MAX_PER_WINDOW {
            check_identity_rate_limit(&store, "user_login", "user@example.com", 1_000, IDENTITY_LOGIN_MAX_PER_WINDOW)
                .unwrap();
        }
        assert!(matches!(
            check_identity_rate_limit(&store, "user_login", "user@example.com", 1_000, IDENTITY_LOGIN_MAX_PER_WINDOW),
            Err(AppError::RateLimited)
        ));
    }

    #[test]
    fn identity_rate_limit_keys_are_scoped_independently() {
        let store = SqliteStore::open_in_memory().unwrap();
        for _ in 0..IDENTITY_LOGIN_MAX_PER_WINDOW {
            check_identity_rate_limit(&store, "user_login", "user@example.com", 1_000, IDENTITY_LOGIN_MAX_PER_WINDOW)
                .unwrap();
        }
        // A different scope for the same identity starts its own counter.
        check_identity_rate_limit(&store, "otp_verify", "user@example.com", 1_000, IDENTITY_OTP_MAX_PER_WINDOW)
            .unwrap();
    }
}
