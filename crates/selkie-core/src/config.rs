//! Configuration for Selkie
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::policy::ExceptionReaction;
use serde::{Deserialize, Serialize};

/// Main configuration for an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Default thread-pool dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Environment-level exception reaction, the end of the
    /// agent -> cooperation -> environment chain
    #[serde(default = "default_exception_reaction")]
    pub exception_reaction: ExceptionReaction,
}

fn default_exception_reaction() -> ExceptionReaction {
    ExceptionReaction::Abort
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            exception_reaction: default_exception_reaction(),
        }
    }
}

impl EnvConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        if self.exception_reaction == ExceptionReaction::Inherit {
            return Err(Error::invalid_configuration(
                "exception_reaction",
                "the environment is the end of the inherit chain",
            ));
        }
        Ok(())
    }
}

/// Worker-thread configuration for a dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of worker threads in the pool
    #[serde(default = "default_worker_threads")]
    pub worker_threads_count: usize,

    /// Demands executed for one agent before the worker yields to another
    #[serde(default = "default_demand_batch")]
    pub demand_batch_count: usize,
}

fn default_worker_threads() -> usize {
    WORKER_THREADS_COUNT_DEFAULT
}

fn default_demand_batch() -> usize {
    DEMAND_BATCH_COUNT_DEFAULT
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads_count: default_worker_threads(),
            demand_batch_count: default_demand_batch(),
        }
    }
}

impl DispatcherConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads_count == 0 || self.worker_threads_count > WORKER_THREADS_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "dispatcher.worker_threads_count",
                format!(
                    "{} is outside 1..={}",
                    self.worker_threads_count, WORKER_THREADS_COUNT_MAX
                ),
            ));
        }

        if self.demand_batch_count == 0 || self.demand_batch_count > DEMAND_BATCH_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "dispatcher.demand_batch_count",
                format!(
                    "{} is outside 1..={}",
                    self.demand_batch_count, DEMAND_BATCH_COUNT_MAX
                ),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EnvConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EnvConfig::default();
        config.dispatcher.worker_threads_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inherit_at_env_level_rejected() {
        let mut config = EnvConfig::default();
        config.exception_reaction = ExceptionReaction::Inherit;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_of_one_is_allowed() {
        let mut config = EnvConfig::default();
        config.dispatcher.demand_batch_count = 1;
        assert!(config.validate().is_ok());
    }
}
