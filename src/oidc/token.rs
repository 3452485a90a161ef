//! ID/access token minting (section 4.E "Token minting"). JWTs signed
//! with the active ES256 key via `jsonwebtoken`, since this core is the
//! provider — not a relying party — so `openidconnect::CoreClient` has no
//! role here.

use crate::error::AppError;
use crate::kek::SigningKeyCache;
use crate::store::{GroupRow, RoleRow, UserRow};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub permissions: Vec<String>,
    pub groups: Vec<String>,
    pub amr: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

pub struct TokenMintParams<'a> {
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub user: &'a UserRow,
    pub groups: &'a [GroupRow],
    pub roles: &'a [RoleRow],
    pub otp_elevated: bool,
    pub nonce: Option<String>,
    pub issued_at: i64,
    pub ttl_secs: i64,
}

pub fn build_claims(params: &TokenMintParams) -> IdTokenClaims {
    let mut amr = vec!["pwd".to_string()];
    if params.otp_elevated {
        amr.push("otp".to_string());
    }
    let permissions = params
        .roles
        .iter()
        .flat_map(|role| role.permissions.iter().cloned())
        .collect();
    let groups = params.groups.iter().map(|g| g.name.clone()).collect();

    IdTokenClaims {
        iss: params.issuer.to_string(),
        sub: params.user.sub.clone(),
        aud: params.client_id.to_string(),
        iat: params.issued_at,
        exp: params.issued_at + params.ttl_secs,
        email: Some(params.user.email.clone()),
        name: params.user.display_name.clone(),
        permissions,
        groups,
        amr,
        nonce: params.nonce.clone(),
    }
}

/// Signs `claims` with the current active key, using its `kid` in the JWT
/// header so verifiers can pick the right JWKS entry.
pub fn sign(signing_keys: &SigningKeyCache, claims: &IdTokenClaims) -> Result<String, AppError> {
    signing_keys.with_signing_key(|kid, signing_key| {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        let pkcs8 = p256::pkcs8::EncodePrivateKey::to_pkcs8_pem(
            signing_key,
            p256::pkcs8::LineEnding::LF,
        )
        .map_err(|_| AppError::Internal)?;
        let encoding_key =
            EncodingKey::from_ec_pem(pkcs8.as_bytes()).map_err(|_| AppError::Internal)?;
        jsonwebtoken::encode(&header, claims, &encoding_key).map_err(|_| AppError::Internal)
    })
}

/// Opaque bearer access token: unlike the ID token this is not a JWT the
/// relying party parses, only a random identifier the resource server
/// validates against the session store — mirrors section 4.E step 8's
/// distinct `access_token`/`id_token` fields.
pub fn mint_access_token() -> String {
    crate::crypto::b64u_encode(&crate::crypto::random_bytes::<32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_claims_includes_otp_in_amr_only_when_elevated() {
        let user = UserRow {
            sub: "sub-1".to_string(),
            email: "user@example.com".to_string(),
            display_name: None,
            wrapped_drk: None,
            created_at: 0,
        };
        let params = TokenMintParams {
            issuer: "https://auth.example.com",
            client_id: "client-1",
            user: &user,
            groups: &[],
            roles: &[],
            otp_elevated: false,
            nonce: None,
            issued_at: 1000,
            ttl_secs: 3600,
        };
        let claims = build_claims(&params);
        assert!(!claims.amr.contains(&"otp".to_string()));

        let elevated_params = TokenMintParams {
            otp_elevated: true,
            ..params
        };
        let claims = build_claims(&elevated_params);
        assert!(claims.amr.contains(&"otp".to_string()));
    }
}
