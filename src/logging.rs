//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from the `DAGRELAY_LOG` environment variable
//! (e.g. `info`, `dagrelay=debug`), falling back to `default_directive`.

use tracing_subscriber::EnvFilter;

use crate::DagError;

pub const LOG_ENV: &str = "DAGRELAY_LOG";

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(default_directive: &str) -> Result<(), DagError> {
    let filter = build_filter(std::env::var(LOG_ENV).ok().as_deref(), default_directive)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .map_err(|e| DagError::Config(format!("failed to install logger: {}", e)))
}

fn build_filter(from_env: Option<&str>, default_directive: &str) -> Result<EnvFilter, DagError> {
    if let Some(directives) = from_env.filter(|s| !s.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(default_directive)
        .map_err(|e| DagError::Config(format!("invalid log directive '{}': {}", default_directive, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn env_directive_wins_over_default() {
        let filter = build_filter(Some("debug"), "info").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn blank_env_falls_back_to_default() {
        let filter = build_filter(Some("  "), "warn").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
        let filter = build_filter(None, "info").unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }
}
