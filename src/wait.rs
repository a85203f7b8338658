//! Wait strategies invoked when a source tick collects nothing.
//!
//! Strategies are looked up by name in a [`WaitStrategyRegistry`] once, when a
//! source executor is prepared. The registry ships `noop`, `sleep` and
//! `backoff`; hosts may register their own constructors.

use crate::config::TaskConfig;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Name of the strategy used when none is configured.
pub const DEFAULT_WAIT_STRATEGY: &str = "noop";

/// Error type for wait-strategy resolution.
#[derive(Error, Debug)]
pub enum WaitStrategyError {
  /// No constructor is registered under the configured name.
  #[error("unknown wait strategy '{name}'")]
  Unknown {
    /// Configured name.
    name: String,
  },
  /// The strategy rejected the configuration.
  #[error("unable to prepare wait strategy '{name}': {reason}")]
  Prepare {
    /// Strategy name.
    name: String,
    /// Reason given by the strategy.
    reason: String,
  },
}

/// Backoff applied by a source after an empty tick.
pub trait WaitStrategy: Send {
  /// Reads strategy parameters from the task configuration.
  fn prepare(&mut self, config: &TaskConfig) -> Result<(), String>;

  /// Called after each empty tick with the current empty-tick streak (≥ 1).
  fn empty_emit(&mut self, streak: u64);
}

/// Constructor stored in the registry.
pub type WaitStrategyConstructor = fn() -> Box<dyn WaitStrategy>;

/// Name → constructor map for wait strategies.
#[derive(Clone)]
pub struct WaitStrategyRegistry {
  constructors: HashMap<String, WaitStrategyConstructor>,
}

impl WaitStrategyRegistry {
  /// A registry with no strategies at all.
  pub fn empty() -> Self {
    Self {
      constructors: HashMap::new(),
    }
  }

  /// Registers (or replaces) a constructor.
  pub fn register(&mut self, name: impl Into<String>, constructor: WaitStrategyConstructor) {
    self.constructors.insert(name.into(), constructor);
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  /// Instantiates and prepares the strategy named in `config`.
  pub fn resolve(&self, config: &TaskConfig) -> Result<Box<dyn WaitStrategy>, WaitStrategyError> {
    let name = config
      .wait_strategy
      .as_deref()
      .unwrap_or(DEFAULT_WAIT_STRATEGY);
    let constructor = self
      .constructors
      .get(name)
      .ok_or_else(|| WaitStrategyError::Unknown {
        name: name.to_string(),
      })?;
    let mut strategy = constructor();
    strategy
      .prepare(config)
      .map_err(|reason| WaitStrategyError::Prepare {
        name: name.to_string(),
        reason,
      })?;
    Ok(strategy)
  }
}

impl Default for WaitStrategyRegistry {
  fn default() -> Self {
    let mut registry = Self::empty();
    registry.register("noop", || Box::new(NoopWait));
    registry.register("sleep", || Box::new(SleepWait::default()));
    registry.register("backoff", || Box::new(BackoffWait::default()));
    registry
  }
}

impl fmt::Debug for WaitStrategyRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WaitStrategyRegistry")
      .field("names", &self.names())
      .finish()
  }
}

/// Busy-poll: returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWait;

impl WaitStrategy for NoopWait {
  fn prepare(&mut self, _config: &TaskConfig) -> Result<(), String> {
    Ok(())
  }

  fn empty_emit(&mut self, _streak: u64) {}
}

/// Sleeps a fixed time after every empty tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepWait {
  delay: Duration,
}

impl WaitStrategy for SleepWait {
  fn prepare(&mut self, config: &TaskConfig) -> Result<(), String> {
    self.delay = config.wait_sleep();
    Ok(())
  }

  fn empty_emit(&mut self, _streak: u64) {
    std::thread::sleep(self.delay);
  }
}

/// Doubles the delay with every consecutive empty tick, up to a cap.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackoffWait {
  base: Duration,
  cap: Duration,
}

impl BackoffWait {
  /// Delay for the given streak: `base * 2^(streak - 1)`, capped.
  pub fn delay_for(&self, streak: u64) -> Duration {
    let shift = streak.saturating_sub(1).min(31) as u32;
    self.base
      .checked_mul(1u32 << shift)
      .map_or(self.cap, |d| d.min(self.cap))
  }
}

impl WaitStrategy for BackoffWait {
  fn prepare(&mut self, config: &TaskConfig) -> Result<(), String> {
    if config.wait_max_ms < config.wait_sleep_ms {
      return Err(format!(
        "cap {}ms is below base {}ms",
        config.wait_max_ms, config.wait_sleep_ms
      ));
    }
    self.base = config.wait_sleep();
    self.cap = config.wait_max();
    Ok(())
  }

  fn empty_emit(&mut self, streak: u64) {
    std::thread::sleep(self.delay_for(streak));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_name_is_reported() {
    let config = TaskConfig::default().with_wait_strategy("spin-harder");
    let err = WaitStrategyRegistry::default().resolve(&config).err().unwrap();
    assert!(matches!(err, WaitStrategyError::Unknown { ref name } if name == "spin-harder"));
  }

  #[test]
  fn default_is_noop() {
    let registry = WaitStrategyRegistry::default();
    assert_eq!(registry.names(), vec!["backoff", "noop", "sleep"]);
    assert!(registry.resolve(&TaskConfig::default()).is_ok());
  }

  #[test]
  fn backoff_doubles_until_cap() {
    let mut backoff = BackoffWait::default();
    let config = TaskConfig {
      wait_sleep_ms: 2,
      wait_max_ms: 10,
      ..TaskConfig::default()
    };
    backoff.prepare(&config).unwrap();
    assert_eq!(backoff.delay_for(1), Duration::from_millis(2));
    assert_eq!(backoff.delay_for(2), Duration::from_millis(4));
    assert_eq!(backoff.delay_for(3), Duration::from_millis(8));
    assert_eq!(backoff.delay_for(4), Duration::from_millis(10));
    assert_eq!(backoff.delay_for(64), Duration::from_millis(10));
  }

  #[test]
  fn backoff_rejects_inverted_bounds() {
    let config = TaskConfig {
      wait_sleep_ms: 50,
      wait_max_ms: 10,
      ..TaskConfig::default()
    }
    .with_wait_strategy("backoff");
    let err = WaitStrategyRegistry::default().resolve(&config).err().unwrap();
    assert!(matches!(err, WaitStrategyError::Prepare { ref name, .. } if name == "backoff"));
  }
}
