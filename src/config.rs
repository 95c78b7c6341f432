//! File configuration.
//!
//! Every section and field is defaulted, so an empty file (or no file) gives
//! a working setup against a local backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consts::{DEFAULT_API_URL, DEFAULT_WS_URL};
use crate::logging::LogConfig;
use crate::prelude::Result;
use crate::sync::{AliasTable, CanonicalEvent, PollPolicy, ReconnectionConfig, RouterConfig};
use crate::ws::ConnectionConfig;
use crate::Error;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// REST base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Push channel URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// JSON file holding the auth token (`{"token": "..."}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

fn default_base_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            request_timeout_ms: default_request_timeout_ms(),
            token_file: None,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// 0 = never give up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_max_reconnect_attempts() -> u32 {
    8
}

fn default_ping_interval_secs() -> u64 {
    25
}

fn default_pong_timeout_secs() -> u64 {
    60
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl ConnectionSection {
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnection: ReconnectionConfig {
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                backoff_multiplier: self.backoff_multiplier,
                jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
                max_reconnect_attempts: self.max_reconnect_attempts,
            },
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PollerSection {
    #[serde(default = "default_baseline_secs")]
    pub baseline_secs: u64,
    #[serde(default = "default_degraded_secs")]
    pub degraded_secs: u64,
    #[serde(default = "default_relaxed_secs")]
    pub relaxed_secs: u64,
    #[serde(default = "default_quiet_window_secs")]
    pub quiet_window_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_baseline_secs() -> u64 {
    15
}

fn default_degraded_secs() -> u64 {
    3
}

fn default_relaxed_secs() -> u64 {
    60
}

fn default_quiet_window_secs() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            baseline_secs: default_baseline_secs(),
            degraded_secs: default_degraded_secs(),
            relaxed_secs: default_relaxed_secs(),
            quiet_window_secs: default_quiet_window_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl PollerSection {
    pub fn to_poll_policy(&self) -> PollPolicy {
        PollPolicy {
            baseline: Duration::from_secs(self.baseline_secs),
            degraded: Duration::from_secs(self.degraded_secs),
            relaxed: Duration::from_secs(self.relaxed_secs),
            quiet_window: Duration::from_secs(self.quiet_window_secs),
            failure_threshold: self.failure_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouterSection {
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dedup_retention_secs")]
    pub dedup_retention_secs: u64,
    /// Extra raw event names per canonical event, e.g.
    /// `order_status_changed = ["orderStateChanged"]`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, Vec<String>>,
}

fn default_dedup_capacity() -> usize {
    2048
}

fn default_dedup_retention_secs() -> u64 {
    600
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            dedup_retention_secs: default_dedup_retention_secs(),
            aliases: BTreeMap::new(),
        }
    }
}

impl RouterSection {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            dedup_capacity: self.dedup_capacity.max(1),
            dedup_retention: Duration::from_secs(self.dedup_retention_secs),
        }
    }

    /// Default alias table extended with the configured names.
    pub fn alias_table(&self) -> Result<AliasTable> {
        let mut table = AliasTable::with_defaults();
        for (canonical, names) in &self.aliases {
            let canonical: CanonicalEvent = serde_json::from_value(Value::String(canonical.clone()))
                .map_err(|_| Error::Config(format!("unknown canonical event {canonical}")))?;
            for name in names {
                table.add(canonical, name.clone())?;
            }
        }
        Ok(table)
    }
}

impl SyncConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend.base_url.starts_with("http://") && !self.backend.base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "backend.base_url must be http(s): {}",
                self.backend.base_url
            )));
        }
        if !self.backend.ws_url.starts_with("ws://") && !self.backend.ws_url.starts_with("wss://") {
            return Err(Error::Config(format!(
                "backend.ws_url must be ws(s): {}",
                self.backend.ws_url
            )));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(Error::Config("connection.backoff_multiplier must be >= 1.0".into()));
        }
        if self.poller.degraded_secs == 0
            || self.poller.baseline_secs == 0
            || self.poller.relaxed_secs == 0
        {
            return Err(Error::Config("poller intervals must be non-zero".into()));
        }
        if self.router.dedup_retention_secs == 0 {
            return Err(Error::Config("router.dedup_retention_secs must be non-zero".into()));
        }
        self.router.alias_table().map(|_| ())
    }
}
