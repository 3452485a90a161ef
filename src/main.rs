//! Server entrypoint: loads configuration, opens the store, derives the
//! KEK, loads or bootstraps the signing key and OPAQUE server setup, then
//! serves the user and admin surfaces on their configured ports (section
//! 5, 6).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

mod clock;
mod config;
mod crypto;
mod error;
mod http;
mod kek;
mod oidc;
mod opaque;
mod otp;
mod ratelimit;
mod session;
mod store;

use clock::SystemClock;
use config::{AppConfig, FileConfig};
use kek::{KekKdfParams, KekService, SigningKeyCache, SETTINGS_KEY_KEK_KDF};
use store::sqlite::SqliteStore;
use store::Store;

#[derive(Parser, Debug)]
struct CliArgs {
    #[clap(long, default_value = "darkauth.toml")]
    config: PathBuf,
}

fn load_or_init_kek(store: &dyn Store, passphrase: &str) -> Result<KekService> {
    let params = match store.settings_get(SETTINGS_KEY_KEK_KDF)? {
        Some(json) => serde_json::from_str(&json).context("corrupt kek_kdf settings row")?,
        None => {
            let params = KekKdfParams::generate();
            store.settings_set(SETTINGS_KEY_KEK_KDF, &serde_json::to_string(&params)?)?;
            params
        }
    };
    Ok(KekService::derive(passphrase, &params)?)
}

fn bootstrap_signing_key(store: &dyn Store, kek: &KekService) -> Result<SigningKeyCache> {
    if store.signing_keys_get_active()?.is_none() {
        kek::rotate_signing_key(store, kek)?;
    }
    let active = kek::load_active_signing_key(store, kek)?;
    Ok(SigningKeyCache::new(active))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_args = CliArgs::parse();
    let file_config = if cli_args.config.exists() {
        FileConfig::load(&cli_args.config)?
    } else {
        tracing::warn!(path = ?cli_args.config, "no config file found, using defaults");
        FileConfig::default()
    };
    let config = AppConfig::resolve(file_config).context("invalid configuration")?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.sqlite_path)?);
    let kek = Arc::new(load_or_init_kek(store.as_ref(), &config.kek_passphrase)?);
    let signing_keys = Arc::new(bootstrap_signing_key(store.as_ref(), &kek)?);
    let opaque_engine = Arc::new(opaque::OpaqueEngine::load_or_create(store.as_ref(), &kek)?);

    let install_gate = if oidc::is_system_initialized(store.as_ref())? {
        None
    } else {
        Some(oidc::InstallGate::new_and_announce())
    };

    let state = http::state::AppState {
        config: Arc::new(config.clone()),
        store,
        kek,
        signing_keys,
        opaque: opaque_engine,
        clock: Arc::new(SystemClock),
        install_gate: Arc::new(RwLock::new(install_gate)),
    };

    let user_app = http::user_router(state.clone()).into_make_service_with_connect_info::<std::net::SocketAddr>();
    let admin_app = http::admin_router(state.clone()).into_make_service_with_connect_info::<std::net::SocketAddr>();

    let user_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.user_port)).await?;
    let admin_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.admin_port)).await?;

    tracing::info!(user_port = config.user_port, admin_port = config.admin_port, "darkauth-core listening");

    let user_server = axum::serve(user_listener, user_app);
    let admin_server = axum::serve(admin_listener, admin_app);

    tokio::try_join!(
        async { user_server.await.context("user server") },
        async { admin_server.await.context("admin server") },
    )?;

    Ok(())
}
