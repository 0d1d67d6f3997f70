//! Engine configuration.
//!
//! All fields have defaults, so a configuration document only needs to name
//! the values it overrides:
//!
//! ```
//! use tbcfg::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "retries": 5 }"#).unwrap();
//! assert_eq!(config.retries, 5);
//! assert_eq!(config.timeout_ms, 2000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TbError};
use crate::protocol::regs::ROUTER_MAX_ADAPTERS;

/// Default number of resubmissions after a timeout.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default per-attempt timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default polled-wait granularity in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default wait before the first sleep-ready check in milliseconds.
pub const DEFAULT_SLEEP_READY_WAIT_MS: u64 = 50;

/// Default number of sleep-ready checks.
pub const DEFAULT_SLEEP_READY_ATTEMPTS: u32 = 10;

/// Tunables shared by every router of one topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resubmissions after a timed-out attempt (blocking and polled modes).
    pub retries: u32,
    /// Per-attempt response timeout.
    pub timeout_ms: u64,
    /// Sleep step of the polled wait.
    pub poll_interval_ms: u64,
    /// Wait after requesting sleep before checking sleep-ready.
    pub sleep_ready_wait_ms: u64,
    /// Sleep-ready checks before suspend gives up.
    pub sleep_ready_attempts: u32,
    /// Clamp for the adapter count a router reports.
    pub max_adapters: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sleep_ready_wait_ms: DEFAULT_SLEEP_READY_WAIT_MS,
            sleep_ready_attempts: DEFAULT_SLEEP_READY_ATTEMPTS,
            max_adapters: ROUTER_MAX_ADAPTERS,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(TbError::InvalidArgument(
                "timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(TbError::InvalidArgument(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.max_adapters == 0 || self.max_adapters > ROUTER_MAX_ADAPTERS {
            return Err(TbError::InvalidArgument(format!(
                "max_adapters must be within 1..={}",
                ROUTER_MAX_ADAPTERS
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    pub fn sleep_ready_wait(&self) -> Duration {
        Duration::from_millis(self.sleep_ready_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retries, 3);
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.sleep_ready_wait(), Duration::from_millis(50));
        assert_eq!(config.sleep_ready_attempts, 10);
        assert_eq!(config.max_adapters, 64);
    }

    #[test]
    fn test_partial_json() {
        let config =
            EngineConfig::from_json(r#"{ "timeout_ms": 250, "max_adapters": 16 }"#).unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.max_adapters, 16);
        assert_eq!(config.retries, DEFAULT_RETRIES);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "timeout_ms": 0 }"#),
            Err(TbError::InvalidArgument(_))
        ));
        assert!(EngineConfig::from_json(r#"{ "max_adapters": 65 }"#).is_err());
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(TbError::Config(_))
        ));
    }
}
