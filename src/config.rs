use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::CoordinatorError;

pub const CONFIG_ENV_VAR: &str = "TREX_COORDINATOR_CONFIG";

/// Coordinator configuration, optionally read as JSON from `TREX_COORDINATOR_CONFIG`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound on tracked queries (terminal ones included).
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    /// Terminal queries always kept; older ones are evicted only once they
    /// also ended more than `min_query_expire_age_secs` ago.
    #[serde(default = "default_max_query_history")]
    pub max_query_history: usize,
    #[serde(default = "default_min_query_expire_age_secs")]
    pub min_query_expire_age_secs: u64,
    /// When set, the reaper kills queries running longer than this.
    #[serde(default)]
    pub query_max_run_time_secs: Option<u64>,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_max_queries() -> usize {
    1000
}

fn default_max_query_history() -> usize {
    100
}

fn default_min_query_expire_age_secs() -> u64 {
    15 * 60
}

fn default_reaper_interval_ms() -> u64 {
    1000
}

fn default_database_path() -> String {
    ":memory:".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_queries: default_max_queries(),
            max_query_history: default_max_query_history(),
            min_query_expire_age_secs: default_min_query_expire_age_secs(),
            query_max_run_time_secs: None,
            reaper_interval_ms: default_reaper_interval_ms(),
            database_path: default_database_path(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults when the variable is unset; an error when it is set but invalid.
    pub fn from_env() -> Result<Self, CoordinatorError> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(raw) => Self::from_json(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CoordinatorError> {
        let config: CoordinatorConfig = serde_json::from_str(json).map_err(|e| {
            CoordinatorError::Config(format!("Failed to parse {CONFIG_ENV_VAR} JSON: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.max_queries == 0 {
            return Err(CoordinatorError::Config(
                "max_queries must be greater than zero".to_string(),
            ));
        }
        if self.max_query_history > self.max_queries {
            return Err(CoordinatorError::Config(format!(
                "max_query_history ({}) must not exceed max_queries ({})",
                self.max_query_history, self.max_queries
            )));
        }
        if self.reaper_interval_ms == 0 {
            return Err(CoordinatorError::Config(
                "reaper_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.query_max_run_time_secs == Some(0) {
            return Err(CoordinatorError::Config(
                "query_max_run_time_secs must be greater than zero when set".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(CoordinatorError::Config(
                "database_path must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_query_expire_age(&self) -> Duration {
        Duration::from_secs(self.min_query_expire_age_secs)
    }

    pub fn query_max_run_time(&self) -> Option<Duration> {
        self.query_max_run_time_secs.map(Duration::from_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}
