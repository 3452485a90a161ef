//! Shared application state, generalizing the teacher's
//! `server/state.rs` `ServerState` (catalog/search handles behind `Arc`)
//! to the section 5 "Shared resources" list.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::kek::{KekService, SigningKeyCache};
use crate::oidc::InstallGate;
use crate::opaque::OpaqueEngine;
use crate::store::Store;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub kek: Arc<KekService>,
    pub signing_keys: Arc<SigningKeyCache>,
    pub opaque: Arc<OpaqueEngine>,
    pub clock: Arc<dyn Clock>,
    /// `Some` until `/install/complete` succeeds, then cleared so the
    /// one-time token can never be reused (section 4.E install gate).
    pub install_gate: Arc<RwLock<Option<InstallGate>>>,
}
