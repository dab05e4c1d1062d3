//! Session configuration.

use serde::Deserialize;
use tessera_core::{ConcurrencyMode, ConfigError, Error, Result};
use tessera_query::TreeLimits;

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Batch size of lazy joins without an explicit size.
    pub default_lazy_batch_size: usize,
    /// Batch size of query joins without an explicit size.
    pub default_query_batch_size: usize,
    /// Deepest join a query may build.
    pub max_join_depth: usize,
    /// Return an error instead of warning when `max_join_depth` is hit.
    pub fail_on_max_join_depth: bool,
    /// Optimistic concurrency for updates and deletes.
    pub concurrency_mode: ConcurrencyMode,
    /// Update only changed properties.
    pub dynamic_updates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_lazy_batch_size: 10,
            default_query_batch_size: 100,
            max_join_depth: 8,
            fail_on_max_join_depth: false,
            concurrency_mode: ConcurrencyMode::Version,
            dynamic_updates: true,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session config: {}", e),
                source: Some(Box::new(e)),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default_lazy_batch_size == 0 || self.default_query_batch_size == 0 {
            return Err(Error::Config(ConfigError {
                message: "batch sizes must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    /// Join tree limits for the plan cache.
    pub fn tree_limits(&self) -> TreeLimits {
        TreeLimits {
            max_depth: self.max_join_depth,
            fail_on_max_depth: self.fail_on_max_join_depth,
        }
    }
}
