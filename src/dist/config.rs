//! Configuration of the distribution roles.

use crate::component::Props;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

fn millis<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

/// Deserialize a config from `Props`; `null` yields the default.
pub(crate) fn from_props<T: for<'de> Deserialize<'de> + Default>(props: &Props) -> Result<T> {
    if props.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(props.clone()).map_err(|e| Error::Config(e.to_string()))
}

/// Master role configuration.
///
/// Durations are given in milliseconds in JSON (`"worker_timeout": 5000`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Listen address (`host:port`, port 0 picks a free port).
    pub bind: String,
    /// Accept workers as soon as the master starts.
    pub allow_connections: bool,
    /// Tasks created per connected worker by `dispatch`.
    pub tasks_per_worker: usize,
    /// When non-zero, split into tasks of this many indices instead.
    pub task_size: u64,
    /// A worker silent for this long while holding a task is considered failed.
    #[serde(deserialize_with = "millis")]
    pub worker_timeout: Duration,
    /// How long `notify_completed` and `gather_result` wait without progress.
    #[serde(deserialize_with = "millis")]
    pub completion_timeout: Duration,
    /// Maximum time a worker may take to send its hello.
    #[serde(deserialize_with = "millis")]
    pub handshake_timeout: Duration,
    /// Polling period of the accept loop and of idle sessions.
    #[serde(deserialize_with = "millis")]
    pub poll_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:14630".to_string(),
            allow_connections: true,
            tasks_per_worker: 1,
            task_size: 0,
            worker_timeout: Duration::from_secs(10),
            completion_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl MasterConfig {
    /// Parse from `Props`.
    pub fn from_props(props: &Props) -> Result<Self> {
        from_props(props)
    }

    /// Set the listen address.
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Set whether connections are accepted from the start.
    pub fn with_allow_connections(mut self, allow: bool) -> Self {
        self.allow_connections = allow;
        self
    }

    /// Set the number of tasks per worker.
    pub fn with_tasks_per_worker(mut self, n: usize) -> Self {
        self.tasks_per_worker = n;
        self
    }

    /// Set a fixed task size.
    pub fn with_task_size(mut self, size: u64) -> Self {
        self.task_size = size;
        self
    }

    /// Set the worker silence timeout.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the completion timeout.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

/// Worker role configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Master address.
    pub address: String,
    /// Display name sent in the hello.
    pub name: String,
    /// Heartbeat period.
    #[serde(deserialize_with = "millis")]
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for the master's welcome.
    #[serde(deserialize_with = "millis")]
    pub handshake_timeout: Duration,
    /// Connection retry policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:14630".to_string(),
            name: default_worker_name(),
            heartbeat_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn default_worker_name() -> String {
    format!("worker-{}", std::process::id())
}

impl WorkerConfig {
    /// Parse from `Props`.
    pub fn from_props(props: &Props) -> Result<Self> {
        from_props(props)
    }

    /// Set the master address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// How a worker retries connecting to its master.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts after the first failure before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(deserialize_with = "millis")]
    pub delay: Duration,
    /// Backoff for subsequent retries.
    pub backoff: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential {
                factor: 2.0,
                max: Duration::from_secs(5),
            },
        }
    }
}

impl ReconnectPolicy {
    /// Never retry.
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Retry up to `max_attempts` times.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Linear { increment } => self.delay + *increment * attempt,
            BackoffStrategy::Exponential { factor, max } => {
                let delay = self.delay.as_secs_f64() * factor.powi(attempt as i32);
                if delay.is_finite() && delay < max.as_secs_f64() {
                    Duration::from_secs_f64(delay.max(0.0))
                } else {
                    *max
                }
            }
        }
    }
}

/// Backoff strategy for retry delays.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Linear increase in delay.
    Linear {
        /// Delay increment per retry, in milliseconds in JSON.
        #[serde(deserialize_with = "millis")]
        increment: Duration,
    },
    /// Exponential increase in delay.
    Exponential {
        /// Multiplier per retry.
        factor: f64,
        /// Maximum delay, in milliseconds in JSON.
        #[serde(deserialize_with = "millis")]
        max: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_master_defaults_and_overrides() {
        let config = MasterConfig::from_props(&Props::Null).unwrap();
        assert_eq!(config.tasks_per_worker, 1);

        let config = MasterConfig::from_props(&json!({
            "bind": "0.0.0.0:9000",
            "worker_timeout": 250
        }))
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.worker_timeout, Duration::from_millis(250));
        assert!(config.allow_connections);
    }

    #[test]
    fn test_worker_config_with_backoff() {
        let config = WorkerConfig::from_props(&json!({
            "address": "10.0.0.2:14630",
            "reconnect": { "max_attempts": 2, "delay": 10, "backoff": { "kind": "fixed" } }
        }))
        .unwrap();
        assert_eq!(config.address, "10.0.0.2:14630");
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.delay_for_attempt(5), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            MasterConfig::from_props(&json!({ "tasks_per_worker": "many" })),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear {
                increment: Duration::from_millis(50),
            },
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));

        let policy = ReconnectPolicy {
            backoff: BackoffStrategy::Exponential {
                factor: 2.0,
                max: Duration::from_millis(300),
            },
            ..policy
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(300));
        assert_eq!(ReconnectPolicy::never().max_attempts, 0);
    }
}
