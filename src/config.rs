//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TTYHUB_TOKEN`, `TTYHUB_LISTEN`,
//!    `TTYHUB_CONTROL_ROOT`
//! 2. **Config file** — path via `--config <path>`, or `ttyhub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! Unknown keys are ignored. The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:4020"
//! access_mode = "local"            # local | network | tunnel
//! control_root = ""                # empty = per-user temp dir
//! cleanup_on_startup = false
//! cleanup_age_hours = 24
//! max_frame_bytes = 16777216       # 16 MiB
//! subscriber_queue_len = 256
//! backpressure_grace_ms = 30000
//! ipc_max_connections = 64
//! recording_queue_len = 1024
//! record_input = false
//! default_title_mode = "dynamic"
//! default_cols = 80
//! default_rows = 24
//!
//! [auth]
//! token = ""                       # empty = auth disabled
//!
//! [logging]
//! level = "info"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::session::registry::RegistrySettings;
use crate::session::store::TitleMode;
use crate::session::SessionTuning;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the HTTP front-end binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Loopback only.
    #[default]
    Local,
    /// All interfaces.
    Network,
    /// All interfaces; an external tunnel fronts the server.
    Tunnel,
}

/// HTTP server and session-core settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:4020`). The host part is
    /// overridden by `access_mode`.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Root directory for per-session control dirs. Empty selects a short
    /// per-user path under the system temp dir (socket paths are length-
    /// limited, so short beats descriptive here).
    #[serde(default)]
    pub control_root: String,
    /// Delete stale exited-session dirs at launch (default false).
    #[serde(default)]
    pub cleanup_on_startup: bool,
    /// Age threshold for startup cleanup (default 24 h).
    #[serde(default = "default_cleanup_age_hours")]
    pub cleanup_age_hours: u64,
    /// Maximum frame payload on IPC sockets (default 16 MiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Envelope queue length per subscriber (default 256).
    #[serde(default = "default_subscriber_queue_len")]
    pub subscriber_queue_len: usize,
    /// How long a subscriber may stay saturated before eviction (default 30 s).
    #[serde(default = "default_backpressure_grace_ms")]
    pub backpressure_grace_ms: u64,
    /// Concurrent IPC connections per session (default 64).
    #[serde(default = "default_ipc_max_connections")]
    pub ipc_max_connections: usize,
    /// Recording event queue length (default 1024, the floor).
    #[serde(default = "default_recording_queue_len")]
    pub recording_queue_len: usize,
    /// Record terminal input as `'i'` events (default false).
    #[serde(default)]
    pub record_input: bool,
    /// Title mode applied when a create request doesn't specify one.
    #[serde(default)]
    pub default_title_mode: TitleMode,
    /// Default terminal size for new sessions.
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
    /// Maximum concurrent HTTP connections (default 128).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds between registry sweeps (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Pre-shared bearer token. Empty or absent disables the auth gate.
    /// Override with `TTYHUB_TOKEN`.
    #[serde(default)]
    pub token: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:4020".to_string()
}
fn default_cleanup_age_hours() -> u64 {
    24
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_subscriber_queue_len() -> usize {
    256
}
fn default_backpressure_grace_ms() -> u64 {
    30_000
}
fn default_ipc_max_connections() -> usize {
    64
}
fn default_recording_queue_len() -> usize {
    1024
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_max_connections() -> usize {
    128
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            access_mode: AccessMode::default(),
            control_root: String::new(),
            cleanup_on_startup: false,
            cleanup_age_hours: default_cleanup_age_hours(),
            max_frame_bytes: default_max_frame_bytes(),
            subscriber_queue_len: default_subscriber_queue_len(),
            backpressure_grace_ms: default_backpressure_grace_ms(),
            ipc_max_connections: default_ipc_max_connections(),
            recording_queue_len: default_recording_queue_len(),
            record_input: false,
            default_title_mode: TitleMode::default(),
            default_cols: default_terminal_cols(),
            default_rows: default_terminal_rows(),
            max_connections: default_max_connections(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `ttyhub.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if std::path::Path::new("ttyhub.toml").exists() {
            let content =
                std::fs::read_to_string("ttyhub.toml").expect("Failed to read ttyhub.toml");
            toml::from_str(&content).expect("Failed to parse ttyhub.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(token) = std::env::var("TTYHUB_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(listen) = std::env::var("TTYHUB_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(root) = std::env::var("TTYHUB_CONTROL_ROOT") {
            config.server.control_root = root;
        }

        config
    }

    /// Validation errors, empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.effective_listen().parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("server.listen is not a socket address: {}", self.server.listen));
        }
        if self.server.subscriber_queue_len == 0 {
            errors.push("server.subscriber_queue_len must be at least 1".to_string());
        }
        if self.server.max_frame_bytes < 4096 {
            errors.push("server.max_frame_bytes must be at least 4096".to_string());
        }
        if self.server.default_cols == 0 || self.server.default_rows == 0 {
            errors.push("server.default_cols/default_rows must be nonzero".to_string());
        }
        if self.server.ipc_max_connections == 0 {
            errors.push("server.ipc_max_connections must be at least 1".to_string());
        }
        errors
    }

    /// Bind address with the `access_mode` host override applied.
    pub fn effective_listen(&self) -> String {
        let port = self
            .server
            .listen
            .rsplit(':')
            .next()
            .unwrap_or("4020")
            .to_string();
        match self.server.access_mode {
            AccessMode::Local => format!("127.0.0.1:{port}"),
            AccessMode::Network | AccessMode::Tunnel => format!("0.0.0.0:{port}"),
        }
    }

    /// Resolved control root: configured path, or a short per-user default.
    pub fn control_root_path(&self) -> PathBuf {
        if self.server.control_root.is_empty() {
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("ttyhub-{uid}"))
        } else {
            PathBuf::from(&self.server.control_root)
        }
    }

    /// Auth token, with the empty string normalized to disabled.
    pub fn auth_token(&self) -> Option<String> {
        if self.auth.token.is_empty() {
            None
        } else {
            Some(self.auth.token.clone())
        }
    }

    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.server.backpressure_grace_ms)
    }

    /// Bundle the registry-facing knobs.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            tuning: SessionTuning {
                subscriber_queue_len: self.server.subscriber_queue_len,
                backpressure_grace: self.backpressure_grace(),
                max_payload: self.server.max_frame_bytes,
                recording_queue_len: self.server.recording_queue_len,
                record_input: self.server.record_input,
            },
            ipc_max_connections: self.server.ipc_max_connections,
            max_frame: self.server.max_frame_bytes,
            default_title_mode: self.server.default_title_mode,
            default_cols: self.server.default_cols,
            default_rows: self.server.default_rows,
            default_cwd: "/".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:4020");
        assert_eq!(config.server.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.server.subscriber_queue_len, 256);
        assert_eq!(config.server.backpressure_grace_ms, 30_000);
        assert_eq!(config.server.ipc_max_connections, 64);
        assert!(!config.server.cleanup_on_startup);
        assert!(config.auth_token().is_none());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            some_future_option = true

            [frobnicator]
            level = 11
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_access_mode_controls_bind_host() {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:4020".into();
        assert_eq!(config.effective_listen(), "127.0.0.1:4020");

        config.server.access_mode = AccessMode::Network;
        assert_eq!(config.effective_listen(), "0.0.0.0:4020");

        config.server.access_mode = AccessMode::Tunnel;
        assert_eq!(config.effective_listen(), "0.0.0.0:4020");
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut config = Config::default();
        config.server.listen = "nonsense".into();
        config.server.subscriber_queue_len = 0;
        config.server.max_frame_bytes = 16;
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_control_root_default_is_short() {
        let config = Config::default();
        let root = config.control_root_path();
        // Leave plenty of headroom for "/<uuid>/ipc.sock" under the
        // 104-byte sockaddr_un cap.
        assert!(root.as_os_str().len() < 50);
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let config: Config = toml::from_str("[auth]\ntoken = \"\"").unwrap();
        assert!(config.auth_token().is_none());

        let config: Config = toml::from_str("[auth]\ntoken = \"secret\"").unwrap();
        assert_eq!(config.auth_token().as_deref(), Some("secret"));
    }
}
