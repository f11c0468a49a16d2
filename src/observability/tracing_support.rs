//! Tracing integration for structured logging and spans.

use serde::Deserialize;
use tracing::{Level, Span, span};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Configuration for the process-wide log subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Install a subscriber at all. Off when the host application owns logging.
    pub enabled: bool,
    /// Filter directive, e.g. `"info"` or `"lumen=debug"`. `RUST_LOG` wins when set.
    pub level: String,
    /// Include the module path in each line.
    pub with_target: bool,
    /// Include the emitting thread name.
    pub with_thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            with_target: false,
            with_thread_names: true,
        }
    }
}

impl TracingConfig {
    /// Debug-level output for everything in this crate.
    pub fn verbose() -> Self {
        Self {
            level: "lumen=debug".to_string(),
            with_target: true,
            ..Self::default()
        }
    }

    /// No subscriber.
    pub fn none() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the filter directive.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| Error::Config(format!("invalid log filter '{}': {e}", self.level)))
    }
}

/// Install a `tracing-subscriber` fmt subscriber.
///
/// Returns `Ok(false)` if logging is disabled or another subscriber was
/// already installed (for instance by a previous runtime in this process).
pub fn init_tracing(config: &TracingConfig) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }
    let installed = tracing_subscriber::fmt()
        .with_env_filter(config.filter()?)
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names)
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Span covering one plugin load.
#[inline]
pub fn span_plugin_load(path: &str) -> Span {
    span!(Level::DEBUG, "plugin_load", path = %path)
}

/// Span covering one master dispatch pass over `[start, end)`.
#[inline]
pub fn span_master_pass(start: u64, end: u64) -> Span {
    span!(Level::INFO, "master_pass", start, end)
}

/// Span covering a worker session (on either side of the connection).
#[inline]
pub fn span_worker_session(name: &str) -> Span {
    span!(Level::INFO, "worker_session", name = %name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_tracing_config_from_json() {
        let config: TracingConfig =
            serde_json::from_value(serde_json::json!({ "level": "warn" })).unwrap();
        assert_eq!(config.level, "warn");
        assert!(config.enabled);
    }

    #[test]
    fn test_disabled_installs_nothing() {
        assert!(!init_tracing(&TracingConfig::none()).unwrap());
    }

    #[test]
    fn test_span_creation() {
        let _span = span_plugin_load("/tmp/libdemo.so");
        let _guard = span_master_pass(0, 100).entered();
        let _guard = span_worker_session("w1").entered();
    }
}
