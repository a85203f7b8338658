//! Task configuration and per-task context.
//!
//! [`TaskConfig`] keeps the host's dotted key names so an existing topology
//! configuration map can be deserialized unchanged:
//!
//! ```rust
//! use batchweave::config::TaskConfig;
//!
//! let config = TaskConfig::from_json(r#"{
//!     "topology.spout.max.batch.size": 250,
//!     "topology.spout.wait.strategy": "sleep"
//! }"#).unwrap();
//! assert_eq!(config.max_batch_size, 250);
//! ```

use crate::wait::WaitStrategyRegistry;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default number of pulls a source makes per batch tick.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
/// Default number of records a sink packs into one physical record.
pub const DEFAULT_MAX_BIN_SIZE: usize = 1000;

/// Error type for configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The configuration document could not be parsed.
  #[error("invalid task configuration: {0}")]
  Parse(#[from] serde_json::Error),
  /// A value is out of range.
  #[error("invalid value for {key}: {reason}")]
  Invalid {
    /// Offending key.
    key: &'static str,
    /// Why it was rejected.
    reason: String,
  },
}

/// Configuration shared by every executor of a task.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
  /// Maximum pulls per source tick.
  #[serde(rename = "topology.spout.max.batch.size")]
  pub max_batch_size: usize,
  /// Name of the wait strategy invoked on empty ticks. `None` selects the no-op strategy.
  #[serde(rename = "topology.spout.wait.strategy")]
  pub wait_strategy: Option<String>,
  /// Sleep time for the `sleep` strategy, and the base delay for `backoff`.
  #[serde(rename = "topology.sleep.spout.wait.strategy.time.ms")]
  pub wait_sleep_ms: u64,
  /// Upper bound on a single `backoff` wait.
  #[serde(rename = "topology.max.spout.wait.ms")]
  pub wait_max_ms: u64,
  /// Records per physical record written by a sink.
  #[serde(rename = "topology.sink.max.bin.size")]
  pub max_bin_size: usize,
}

impl Default for TaskConfig {
  fn default() -> Self {
    Self {
      max_batch_size: DEFAULT_MAX_BATCH_SIZE,
      wait_strategy: None,
      wait_sleep_ms: 1,
      wait_max_ms: 1000,
      max_bin_size: DEFAULT_MAX_BIN_SIZE,
    }
  }
}

impl TaskConfig {
  /// Creates a configuration with default values.
  pub fn new() -> Self {
    Self::default()
  }

  /// Parses and validates a JSON configuration document.
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let config: TaskConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Rejects values the executors cannot work with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_batch_size == 0 {
      return Err(ConfigError::Invalid {
        key: "topology.spout.max.batch.size",
        reason: "must be at least 1".to_string(),
      });
    }
    if self.max_bin_size == 0 {
      return Err(ConfigError::Invalid {
        key: "topology.sink.max.bin.size",
        reason: "must be at least 1".to_string(),
      });
    }
    Ok(())
  }

  /// Sets the maximum pulls per source tick.
  pub fn with_max_batch_size(mut self, n: usize) -> Self {
    self.max_batch_size = n;
    self
  }

  /// Selects a wait strategy by registered name.
  pub fn with_wait_strategy(mut self, name: impl Into<String>) -> Self {
    self.wait_strategy = Some(name.into());
    self
  }

  /// Sets the base wait delay in milliseconds.
  pub fn with_wait_sleep_ms(mut self, ms: u64) -> Self {
    self.wait_sleep_ms = ms;
    self
  }

  /// Sets the maximum records per physical record.
  pub fn with_max_bin_size(mut self, n: usize) -> Self {
    self.max_bin_size = n;
    self
  }

  /// Base wait delay.
  pub fn wait_sleep(&self) -> Duration {
    Duration::from_millis(self.wait_sleep_ms)
  }

  /// Wait delay cap.
  pub fn wait_max(&self) -> Duration {
    Duration::from_millis(self.wait_max_ms)
  }
}

/// Identity of one running task instance.
#[derive(Clone, Debug)]
pub struct TaskContext {
  /// Task name, used in logs and state-store names.
  pub task_name: String,
  /// Index of this instance among the task's parallel instances.
  pub instance: usize,
  /// Number of parallel instances of the task.
  pub instances: usize,
  /// Registry used to resolve the configured wait strategy.
  pub wait_strategies: Arc<WaitStrategyRegistry>,
}

impl TaskContext {
  /// Context for a single-instance task with the built-in wait strategies.
  pub fn new(task_name: impl Into<String>) -> Self {
    Self {
      task_name: task_name.into(),
      instance: 0,
      instances: 1,
      wait_strategies: Arc::new(WaitStrategyRegistry::default()),
    }
  }

  /// Sets the instance index and count.
  pub fn with_instance(mut self, instance: usize, instances: usize) -> Self {
    self.instance = instance;
    self.instances = instances;
    self
  }

  /// Replaces the wait-strategy registry.
  pub fn with_wait_strategies(mut self, registry: Arc<WaitStrategyRegistry>) -> Self {
    self.wait_strategies = registry;
    self
  }
}
