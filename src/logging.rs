//! Structured logging setup.
//!
//! Stdout logging in one of three formats, optionally mirrored into daily
//! rolling files (an activity log and a warnings-only log) via
//! tracing-appender.
//!
//! # Component Targets
//!
//! | Target | Description |
//! |--------|-------------|
//! | `sync::connection` | Push channel lifecycle, reconnects, acks |
//! | `sync::router` | Push event resolution and de-duplication |
//! | `sync::optimistic` | Optimistic intents, confirmations, rollbacks |
//! | `sync::poller` | Fallback polling ticks and failures |
//! | `sync::context` | Sync context state transitions |
//! | `sync::rest` | REST requests and retries |
//!
//! ```bash
//! RUST_LOG=info,sync::router=debug storefront_sync watch-orders
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON, one object per line
    Json,
    /// Compact single-line format
    Compact,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LogConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Mirror logs into daily rolling files under `log_dir`
    #[serde(default)]
    pub enable_files: bool,

    /// Level for the activity file (default: info)
    #[serde(default = "default_file_level")]
    pub file_level: String,

    /// Level for the warnings file (default: warn)
    #[serde(default = "default_error_level")]
    pub error_level: String,

    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,

    #[serde(default)]
    pub stdout_format: LogFormat,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_file_level() -> String {
    "info".to_string()
}

fn default_error_level() -> String {
    "warn".to_string()
}

fn default_enable_stdout() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            enable_files: false,
            file_level: default_file_level(),
            error_level: default_error_level(),
            enable_stdout: default_enable_stdout(),
            stdout_format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// JSON to stdout plus rolling files.
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            enable_files: true,
            stdout_format: LogFormat::Json,
            ..Default::default()
        }
    }
}

fn quiet_dependencies(filter: EnvFilter) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    Ok(filter
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tokio_tungstenite=warn".parse()?)
        .add_directive("tungstenite=warn".parse()?))
}

/// Initialize the global subscriber.
///
/// The returned guards flush the file writers on drop and must be held for
/// the life of the program.
pub fn init_logging(
    config: &LogConfig,
    env_filter_override: Option<&str>,
) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guards = Vec::new();

    let base_filter = match env_filter_override {
        Some(filter) => EnvFilter::new(filter),
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => quiet_dependencies(EnvFilter::new("info"))?,
        },
    };

    if config.enable_files {
        std::fs::create_dir_all(&config.log_dir)?;

        let activity_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "sync-activity.log");
        let (activity_writer, guard) = tracing_appender::non_blocking(activity_appender);
        guards.push(guard);
        let activity_layer = fmt::layer()
            .with_writer(activity_writer)
            .with_ansi(false)
            .json()
            .with_filter(quiet_dependencies(EnvFilter::new(&config.file_level))?);

        let error_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "sync-errors.log");
        let (error_writer, guard) = tracing_appender::non_blocking(error_appender);
        guards.push(guard);
        let error_layer = fmt::layer()
            .with_writer(error_writer)
            .with_ansi(false)
            .json()
            .with_filter(EnvFilter::new(&config.error_level));

        let registry = tracing_subscriber::registry()
            .with(activity_layer)
            .with(error_layer);
        if config.enable_stdout {
            match config.stdout_format {
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_filter(base_filter))
                    .init(),
                LogFormat::Compact => registry
                    .with(fmt::layer().compact().with_filter(base_filter))
                    .init(),
                LogFormat::Pretty => registry
                    .with(fmt::layer().with_target(true).with_filter(base_filter))
                    .init(),
            }
        } else {
            registry.init();
        }

        eprintln!("File logging enabled: {}", config.log_dir.display());
    } else {
        match config.stdout_format {
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(base_filter)
                .json()
                .init(),
            LogFormat::Compact => tracing_subscriber::fmt()
                .with_env_filter(base_filter)
                .compact()
                .init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .with_env_filter(base_filter)
                .init(),
        }
    }

    Ok(guards)
}

/// Log targets for component-specific filtering.
///
/// ```ignore
/// tracing::debug!(target: targets::ROUTER, event = %name, "Duplicate push event dropped");
/// ```
pub mod targets {
    /// Push channel lifecycle, reconnects, acks
    pub const CONNECTION: &str = "sync::connection";
    /// Push event resolution and de-duplication
    pub const ROUTER: &str = "sync::router";
    /// Optimistic intents, confirmations, rollbacks
    pub const OPTIMISTIC: &str = "sync::optimistic";
    /// Fallback polling
    pub const POLLER: &str = "sync::poller";
    /// Sync context state transitions
    pub const CONTEXT: &str = "sync::context";
    /// REST requests and retries
    pub const REST: &str = "sync::rest";
}
