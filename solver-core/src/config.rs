//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Environment variable that turns on per-dispatch pipe logging.
pub const DEBUG_ENV: &str = "SOLVER_SCHEDULER_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Log the status of every pipe an edge sees on each dispatch.
    pub debug: bool,

    /// Name given to the dispatch thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            thread_name: "solver-dispatch".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults, with `debug` taken from [`DEBUG_ENV`].
    pub fn from_env() -> Self {
        let debug = std::env::var(DEBUG_ENV)
            .ok()
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self {
            debug,
            ..Self::default()
        }
    }
}

fn parse_flag(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
        assert!(!parse_flag("nope"));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"debug": true}"#).unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.thread_name, "solver-dispatch");
    }
}
