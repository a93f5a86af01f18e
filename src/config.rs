//! Scheduler settings loaded from TOML.
//!
//! ```toml
//! [scheduler]
//! max_concurrent_tasks = 8
//!
//! [retry]
//! backoff = "exponential"
//! multiplier = 2.0
//! max_interval_secs = 60
//!
//! [notifications]
//! log_base_url = "https://logs.example.com/dags"
//! ```
//!
//! Every section and field is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DagError, RetryManager};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagrelayConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub notifications: NotificationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Upper bound on task instances running at the same time within one run.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent_tasks() -> usize {
    16
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
}

/// Default backoff for tasks that do not set their own policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Only used by the exponential policy.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Only used by the exponential policy.
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_secs() -> u64 {
    30
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::default(),
            multiplier: default_multiplier(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSection {
    /// Base URL used to build the log link in failure notifications.
    #[serde(default)]
    pub log_base_url: Option<String>,
}

impl DagrelayConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, DagError> {
        let config: Self =
            toml::from_str(text).map_err(|e| DagError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DagError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| DagError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), DagError> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(DagError::Config(
                "[scheduler].max_concurrent_tasks must be >= 1 (got 0)".to_string(),
            ));
        }
        let multiplier = self.retry.multiplier;
        if self.retry.backoff == BackoffKind::Exponential && (multiplier.is_nan() || multiplier <= 0.0) {
            return Err(DagError::Config(format!(
                "[retry].multiplier must be > 0 (got {})",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn retry_manager(&self) -> RetryManager {
        match self.retry.backoff {
            BackoffKind::Constant => RetryManager::constant(),
            BackoffKind::Exponential => RetryManager::exponential(
                self.retry.multiplier,
                Duration::from_secs(self.retry.max_interval_secs),
            ),
        }
    }
}
