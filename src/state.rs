//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::session::registry::SessionRegistry;

/// Shared application state for the ttyhub server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns every session and the on-disk control root.
    pub registry: SessionRegistry,
}
