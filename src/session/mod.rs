//! Session & CSRF (section 4.D). Generalizes the teacher's
//! `server/session.rs` `FromRequestParts` extractor pattern to the
//! `__Host-`-prefixed cookie pair, same-origin enforcement, and the
//! double-submit CSRF token the user/admin surfaces both require.

use crate::crypto;
use crate::http::state::AppState;
use crate::store::{SessionDomain, SessionRow};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCookieName {
    User,
    Admin,
}

impl SessionCookieName {
    pub fn session_cookie(self) -> &'static str {
        match self {
            SessionCookieName::User => "__Host-DarkAuth-User",
            SessionCookieName::Admin => "__Host-DarkAuth-Admin",
        }
    }

    pub fn csrf_cookie(self) -> &'static str {
        match self {
            SessionCookieName::User => "__Host-DarkAuth-User-Csrf",
            SessionCookieName::Admin => "__Host-DarkAuth-Admin-Csrf",
        }
    }

    fn domain(self) -> SessionDomain {
        match self {
            SessionCookieName::User => SessionDomain::User,
            SessionCookieName::Admin => SessionDomain::Admin,
        }
    }
}

/// A validated, live session pulled from the store, bound to whichever
/// cookie pair (`User`/`Admin`) it was minted for (section 4.D invariant:
/// the two domains never share a session).
#[derive(Debug, Clone)]
pub struct Session {
    pub row: SessionRow,
}

pub enum SessionRejection {
    Missing,
    Expired,
}

impl IntoResponse for SessionRejection {
    fn into_response(self) -> Response {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn load_session(
    parts: &mut Parts,
    state: &AppState,
    which: SessionCookieName,
) -> Result<Session, SessionRejection> {
    let jar = CookieJar::from_request_parts(parts, state)
        .await
        .map_err(|_| SessionRejection::Missing)?;
    let session_id = jar
        .get(which.session_cookie())
        .map(|c| c.value().to_string())
        .ok_or(SessionRejection::Missing)?;

    let row = state
        .store
        .session_get(&session_id)
        .ok()
        .flatten()
        .ok_or(SessionRejection::Missing)?;

    if row.domain != which.domain() {
        return Err(SessionRejection::Missing);
    }
    let now = state.clock.unix_seconds();
    let inactive_for = now - row.last_seen_at;
    if row.expires_at <= now || inactive_for > state.config.session_inactivity_secs {
        let _ = state.store.session_delete(&session_id);
        return Err(SessionRejection::Expired);
    }

    let _ = state.store.session_touch(&session_id, now);
    Ok(Session { row })
}

/// Extractor for routes under the user session domain.
pub struct UserSession(pub Session);

impl FromRequestParts<AppState> for UserSession {
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        load_session(parts, state, SessionCookieName::User).await.map(UserSession)
    }
}

/// Extractor for routes under the admin session domain.
pub struct AdminSession(pub Session);

impl FromRequestParts<AppState> for AdminSession {
    type Rejection = SessionRejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        load_session(parts, state, SessionCookieName::Admin).await.map(AdminSession)
    }
}

/// Builds the `Set-Cookie` pair for a freshly created session: the
/// HttpOnly session cookie and the JS-readable CSRF cookie the client
/// echoes back in the `X-CSRF-Token` header on unsafe requests.
/// `secure` is `Secure` in production, and only relaxed for
/// `config.is_development` (section 6: "all `Secure` in production").
pub fn session_cookies(
    which: SessionCookieName,
    session_id: &str,
    csrf_token: &str,
    max_age: time::Duration,
    secure: bool,
) -> (Cookie<'static>, Cookie<'static>) {
    let session_cookie = Cookie::build((which.session_cookie(), session_id.to_string()))
        .path("/")
        .secure(secure)
        .http_only(true)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .build();
    let csrf_cookie = Cookie::build((which.csrf_cookie(), csrf_token.to_string()))
        .path("/")
        .secure(secure)
        .http_only(false)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .build();
    (session_cookie, csrf_cookie)
}

pub fn expire_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .max_age(time::Duration::seconds(0))
        .build()
}

/// Double-submit CSRF check (section 4.D): the cookie value and the
/// `X-CSRF-Token` header must match via constant-time comparison, and the
/// check only applies to state-changing methods.
pub fn csrf_is_satisfied(parts: &Parts, jar: &CookieJar, which: SessionCookieName) -> bool {
    if matches!(parts.method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return true;
    }
    let cookie_token = jar.get(which.csrf_cookie()).map(|c| c.value());
    let header_token = parts
        .headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok());
    match (cookie_token, header_token) {
        (Some(c), Some(h)) => crypto::constant_time_eq(c.as_bytes(), h.as_bytes()),
        _ => false,
    }
}

/// Same-origin enforcement for unsafe requests (section 4.D): prefers
/// `Sec-Fetch-Site`, falls back to comparing `Origin`/`Referer` against
/// the configured public origin.
pub fn is_same_origin(parts: &Parts, public_origin: &str) -> bool {
    if matches!(parts.method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return true;
    }
    if let Some(site) = parts.headers.get("sec-fetch-site").and_then(|v| v.to_str().ok()) {
        return site == "same-origin" || site == "none";
    }
    let origin = parts
        .headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.headers.get("referer").and_then(|v| v.to_str().ok()));
    match origin {
        Some(value) => value.starts_with(public_origin),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_check_is_skipped_for_safe_methods() {
        let req = http_parts(Method::GET);
        let jar = CookieJar::new();
        assert!(csrf_is_satisfied(&req, &jar, SessionCookieName::User));
    }

    fn http_parts(method: Method) -> Parts {
        let request = axum::http::Request::builder()
            .method(method)
            .uri("/")
            .body(())
            .unwrap();
        request.into_parts().0
    }

    #[test]
    fn same_origin_allows_matching_origin_header() {
        let mut req = http_parts(Method::POST);
        req.headers.insert("origin", "https://auth.example.com".parse().unwrap());
        assert!(is_same_origin(&req, "https://auth.example.com"));
    }

    #[test]
    fn same_origin_rejects_mismatched_origin_header() {
        let mut req = http_parts(Method::POST);
        req.headers.insert("origin", "https://evil.example.com".parse().unwrap());
        assert!(!is_same_origin(&req, "https://auth.example.com"));
    }
}
