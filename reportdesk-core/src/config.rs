//! Runtime configuration for the reconciliation core.
//!
//! Every interval and timeout is a configurable default rather than a hard
//! contract. The file lives at `$XDG_CONFIG_HOME/reportdesk/config.toml` and
//! every section and key is optional:
//!
//! ```toml
//! [poll]
//! chat_interval_ms = 3000
//! dashboard_interval_ms = 5000
//!
//! [transport]
//! max_reconnect_attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub poll: PollConfig,
    pub ledger: LedgerConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// "Expiring soon" fires when this many seconds remain.
    pub warn_threshold_secs: u64,
    /// Cadence of the remaining-time tick.
    pub tick_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warn_threshold_secs: 5 * 60,
            tick_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn warn_threshold(&self) -> Duration {
        Duration::from_secs(self.warn_threshold_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Attempts after which the transport reports itself permanently down.
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Chat transcripts.
    pub chat_interval_ms: u64,
    /// Complaint state on the dashboard and detail views.
    pub dashboard_interval_ms: u64,
    /// A fetch that takes longer than this counts as a failed tick.
    pub fetch_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            chat_interval_ms: 3000,
            dashboard_interval_ms: 5000,
            fetch_timeout_ms: 10_000,
        }
    }
}

impl PollConfig {
    pub fn chat_interval(&self) -> Duration {
        Duration::from_millis(self.chat_interval_ms.max(1))
    }

    pub fn dashboard_interval(&self) -> Duration {
        Duration::from_millis(self.dashboard_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Unconfirmed optimistic mutations are force-resolved after this long.
    pub resolution_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            resolution_timeout_ms: 10_000,
        }
    }
}

impl LedgerConfig {
    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Two messages with equal sender and content whose timestamps differ by
    /// at most this much are the same logical message.
    pub message_dedupe_window_ms: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            message_dedupe_window_ms: 5000,
        }
    }
}

/// Returns the path to the reportdesk config file.
///
/// Prefers `$XDG_CONFIG_HOME/reportdesk/config.toml`; falls back to
/// `~/.config/reportdesk/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("reportdesk").join("config.toml")
}

/// Parses the config file at `path`.
///
/// # Errors
///
/// Returns `ConfigError::Io` if the file cannot be read and
/// `ConfigError::Parse` if it is not valid TOML for [`SyncConfig`].
pub fn load_config(path: &Path) -> Result<SyncConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

/// Loads the config file, falling back to defaults.
///
/// A missing file is silent; a file that fails to parse is logged and
/// otherwise ignored. Never fails.
pub fn load_or_default(path: &Path) -> SyncConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            SyncConfig::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring config file");
            SyncConfig::default()
        }
    }
}
