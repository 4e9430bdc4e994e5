//! Logging initialisation.
//!
//! Installs a global `tracing` subscriber: an `EnvFilter` plus a `fmt` layer
//! writing JSON lines or human-readable output.

use std::str::FromStr;

use cachemachine_core::ConfigError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when neither the config nor `RUST_LOG` says otherwise.
pub const DEFAULT_LOG_FILTER: &str = "info,cachemachine=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::InvalidValue {
                field: "logFormat".to_string(),
                value: other.to_string(),
                reason: "expected json or pretty".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives. `None` falls back to `RUST_LOG`, then the default.
    pub filter: Option<String>,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: None,
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Environment variables:
    /// - `CACHE_MACHINE_LOG`: filter directives
    /// - `CACHE_MACHINE_LOG_FORMAT`: json or pretty (default: json)
    pub fn from_env() -> Result<Self, ConfigError> {
        let filter = std::env::var("CACHE_MACHINE_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let format = match std::env::var("CACHE_MACHINE_LOG_FORMAT") {
            Ok(raw) => raw.parse()?,
            Err(_) => LogFormat::default(),
        };
        Ok(Self { filter, format })
    }

    fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        match &self.filter {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|e| ConfigError::InvalidValue {
                    field: "logFilter".to_string(),
                    value: directives.clone(),
                    reason: e.to_string(),
                })
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }
}

/// Install the global subscriber. A second call returns an error.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "logging".to_string(),
        value: format!("{:?}", config.format),
        reason: format!("failed to install subscriber: {}", e),
    })
}
