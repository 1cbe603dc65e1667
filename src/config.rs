//! Configuration for the cluster coordinator.
//!
//! The coordinator is configured with a small, validated struct rather than
//! scattered knobs. Construct it directly, from [`Default`], or from
//! environment variables:
//!
//! ```rust
//! use menagerie::CoordinatorConfig;
//!
//! let config = CoordinatorConfig {
//!     namespace: "orders".to_string(),
//!     spare_leader: true,
//!     ..CoordinatorConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::constants::{DEFAULT_SEGMENTS, LATCH_RETRY_DELAY, LATCH_WAIT};
use crate::error::{Error, Result};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Coordination-service endpoints, e.g. `"zk1:2181,zk2:2181"`.
    pub connection_string: String,

    /// Path prefix under which all coordinator nodes live. Every client
    /// handed to the coordinator must already be namespaced to this prefix.
    pub namespace: String,

    /// Number of key-space segments. Must match across all members of a
    /// cluster; changing it remaps every partition key to a new znode path.
    pub segments: u32,

    /// When true, the leader is excluded from partition assignment and only
    /// orchestrates the plan.
    pub spare_leader: bool,

    /// Bounded wait applied to each leader-latch poll.
    pub latch_wait: Duration,

    /// Delay before the leadership acquire loop reschedules itself.
    pub latch_retry_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connection_string: "127.0.0.1:2181".to_string(),
            namespace: "menagerie".to_string(),
            segments: DEFAULT_SEGMENTS,
            spare_leader: false,
            latch_wait: LATCH_WAIT,
            latch_retry_delay: LATCH_RETRY_DELAY,
        }
    }
}

impl CoordinatorConfig {
    /// Build a configuration from `MENAGERIE_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `MENAGERIE_CONNECTION_STRING` | `connection_string` |
    /// | `MENAGERIE_NAMESPACE` | `namespace` |
    /// | `MENAGERIE_SEGMENTS` | `segments` |
    /// | `MENAGERIE_SPARE_LEADER` | `spare_leader` |
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let connection_string = std::env::var("MENAGERIE_CONNECTION_STRING")
            .unwrap_or(defaults.connection_string);

        let namespace = std::env::var("MENAGERIE_NAMESPACE").unwrap_or(defaults.namespace);

        let segments: u32 = std::env::var("MENAGERIE_SEGMENTS")
            .unwrap_or_else(|_| defaults.segments.to_string())
            .parse()
            .map_err(|e| Error::Config(format!("invalid MENAGERIE_SEGMENTS: {e}")))?;

        let spare_leader = std::env::var("MENAGERIE_SPARE_LEADER")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(defaults.spare_leader);

        let config = Self {
            connection_string,
            namespace,
            segments,
            spare_leader,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.is_empty() {
            return Err(Error::Config("connection_string must not be empty".into()));
        }
        if self.segments == 0 {
            return Err(Error::Config("segments must be at least 1".into()));
        }
        if self.latch_wait.is_zero() {
            return Err(Error::Config("latch_wait must be non-zero".into()));
        }
        Ok(())
    }
}
