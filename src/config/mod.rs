//! Configuration (section 6), generalizing the sibling
//! `catalog-server/src/config/file_config.rs` `FileConfig` pattern
//! (optional TOML fields layered over code defaults) to section 6's
//! `dbMode`/`userPort`/`adminPort`/KEK passphrase surface.

use crate::error::AppError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub db_mode: Option<String>,
    pub sqlite_path: Option<String>,
    pub postgres_uri: Option<String>,
    pub user_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub proxy_ui: Option<bool>,
    pub is_development: Option<bool>,
    pub public_origin: Option<String>,
    pub issuer: Option<String>,
    pub rp_id: Option<String>,
    pub access_token_ttl_secs: Option<i64>,
    pub authorization_code_ttl_secs: Option<i64>,
    pub session_ttl_secs: Option<i64>,
    pub session_inactivity_secs: Option<i64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {:?}", path))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    Sqlite,
    Remote,
}

/// Fully resolved, immutable runtime configuration (section 6). `resolve`
/// layers file config over environment variables over hardcoded defaults,
/// matching the precedence the teacher documents for its own CLI/file/env
/// settings in `server/config.rs`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_mode: DbMode,
    pub sqlite_path: String,
    pub postgres_uri: Option<String>,
    pub user_port: u16,
    pub admin_port: u16,
    pub proxy_ui: bool,
    pub is_development: bool,
    pub public_origin: String,
    pub issuer: String,
    pub rp_id: String,
    pub kek_passphrase: String,
    pub access_token_ttl_secs: i64,
    pub authorization_code_ttl_secs: i64,
    /// Absolute session lifetime ceiling (section 4.D: default 12h),
    /// independent of the inactivity window below.
    pub session_ttl_secs: i64,
    /// Inactivity window (section 4.D: default 30 min) — a session with
    /// no request in this span is dead even if the absolute ceiling
    /// hasn't been reached.
    pub session_inactivity_secs: i64,
}

const KEK_PASSPHRASE_ENV_VARS: &[&str] = &["ZKAUTH_KEK_PASSPHRASE", "KEK_PASSPHRASE"];

impl AppConfig {
    pub fn resolve(file: FileConfig) -> Result<Self, AppError> {
        let db_mode = match file.db_mode.as_deref() {
            None | Some("sqlite") => DbMode::Sqlite,
            Some("remote") => DbMode::Remote,
            Some(other) => {
                return Err(AppError::Validation(format!("unknown dbMode: {other}")));
            }
        };

        // Section 6, Open Question resolution (see DESIGN.md): `remote`
        // is accepted syntactically so config files can name the intent,
        // but this build carries no Postgres driver, so startup refuses
        // to proceed rather than silently falling back to SQLite.
        if db_mode == DbMode::Remote {
            return Err(AppError::Internal);
        }

        let kek_passphrase = KEK_PASSPHRASE_ENV_VARS
            .iter()
            .find_map(|name| std::env::var(name).ok())
            .ok_or_else(|| {
                AppError::Validation(
                    "KEK passphrase must be set via ZKAUTH_KEK_PASSPHRASE or KEK_PASSPHRASE".to_string(),
                )
            })?;

        let is_development = file.is_development.unwrap_or(false);
        let public_origin = file
            .public_origin
            .unwrap_or_else(|| "http://localhost:9080".to_string());

        Ok(AppConfig {
            db_mode,
            sqlite_path: file.sqlite_path.unwrap_or_else(|| "./darkauth.sqlite3".to_string()),
            postgres_uri: file.postgres_uri,
            user_port: file.user_port.unwrap_or(9080),
            admin_port: file.admin_port.unwrap_or(9081),
            proxy_ui: file.proxy_ui.unwrap_or(false),
            is_development,
            issuer: file.issuer.unwrap_or_else(|| public_origin.clone()),
            rp_id: file.rp_id.unwrap_or_else(|| "localhost".to_string()),
            public_origin,
            kek_passphrase,
            access_token_ttl_secs: file.access_token_ttl_secs.unwrap_or(3600),
            authorization_code_ttl_secs: file.authorization_code_ttl_secs.unwrap_or(60),
            session_ttl_secs: file.session_ttl_secs.unwrap_or(60 * 60 * 12),
            session_inactivity_secs: file.session_inactivity_secs.unwrap_or(60 * 30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_db_mode_is_rejected_at_resolve_time() {
        std::env::set_var("ZKAUTH_KEK_PASSPHRASE", "x");
        let file = FileConfig {
            db_mode: Some("remote".to_string()),
            ..Default::default()
        };
        assert!(matches!(AppConfig::resolve(file), Err(AppError::Internal)));
    }

    #[test]
    fn missing_passphrase_is_a_validation_error() {
        std::env::remove_var("ZKAUTH_KEK_PASSPHRASE");
        std::env::remove_var("KEK_PASSPHRASE");
        let file = FileConfig::default();
        assert!(matches!(AppConfig::resolve(file), Err(AppError::Validation(_))));
    }
}
