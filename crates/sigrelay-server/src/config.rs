//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use sigrelay_core::codec::DEFAULT_MAX_PAYLOAD;
use sigrelay_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[limits]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_upgrade_attempts")]
    pub upgrade_attempts_per_minute: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            max_header_bytes: default_max_header_bytes(),
            outbound_queue: default_outbound_queue(),
            upgrade_attempts_per_minute: default_upgrade_attempts(),
        }
    }
}

/// `[timeouts]` section of the config TOML. All values in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_close_secs")]
    pub close_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            close_secs: default_close_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_true")]
    pub dedupe_offers: bool,
    #[serde(default = "default_offer_dedupe_window_secs")]
    pub offer_dedupe_window_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            dedupe_offers: true,
            offer_dedupe_window_secs: default_offer_dedupe_window_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_max_header_bytes() -> usize {
    8 * 1024
}
fn default_outbound_queue() -> usize {
    256
}
fn default_upgrade_attempts() -> u32 {
    60
}
fn default_handshake_secs() -> u64 {
    10
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_close_secs() -> u64 {
    5
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_offer_dedupe_window_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_payload: Option<usize>,
    pub ping_interval_secs: Option<u64>,
}

/// Resolved server configuration (CLI overrides applied, durations typed).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub max_header_bytes: usize,
    pub outbound_queue: usize,
    pub upgrade_attempts_per_minute: u32,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub close_timeout: Duration,
    pub shutdown_grace: Duration,
    pub dedupe_offers: bool,
    pub offer_dedupe_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn parse_file(content: &str) -> RelayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Other(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn from_file(file: ConfigFile, overrides: &ConfigOverrides) -> Self {
        let secs = Duration::from_secs;
        Self {
            host: overrides.host.clone().unwrap_or(file.server.host),
            port: overrides.port.unwrap_or(file.server.port),
            max_payload: overrides.max_payload.unwrap_or(file.limits.max_payload),
            max_header_bytes: file.limits.max_header_bytes,
            outbound_queue: file.limits.outbound_queue,
            upgrade_attempts_per_minute: file.limits.upgrade_attempts_per_minute,
            handshake_timeout: secs(file.timeouts.handshake_secs),
            ping_interval: secs(
                overrides
                    .ping_interval_secs
                    .unwrap_or(file.timeouts.ping_interval_secs),
            ),
            pong_timeout: secs(file.timeouts.pong_timeout_secs),
            close_timeout: secs(file.timeouts.close_secs),
            shutdown_grace: secs(file.timeouts.shutdown_grace_secs),
            dedupe_offers: file.relay.dedupe_offers,
            offer_dedupe_window: secs(file.relay.offer_dedupe_window_secs),
        }
    }

    fn validate(&self) -> RelayResult<()> {
        if self.outbound_queue == 0 {
            return Err(RelayError::Other("limits.outbound_queue must be at least 1".into()));
        }
        if self.max_payload == 0 {
            return Err(RelayError::Other("limits.max_payload must be at least 1".into()));
        }
        if self.ping_interval.is_zero() || self.pong_timeout.is_zero() {
            return Err(RelayError::Other("ping interval and pong timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> RelayResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayError::Other(format!("invalid address: {e}")))
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
