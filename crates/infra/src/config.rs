//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

/// Tuning knobs for the job loop, the task loop and the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrent task workers per task loop.
    pub task_slots: usize,
    pub min_pause: Duration,
    pub job_loop_max_pause: Duration,
    pub task_loop_max_pause: Duration,
    /// ACTIVE tasks untouched for longer than this become TIMEOUT.
    pub expiry_window: Duration,
    pub expiry_interval: Duration,
    /// Attempts per task execution before the job is failed.
    pub retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_slots: 10,
            min_pause: Duration::from_secs(1),
            job_loop_max_pause: Duration::from_secs(5),
            task_loop_max_pause: Duration::from_secs(30),
            expiry_window: Duration::from_secs(15 * 60),
            expiry_interval: Duration::from_secs(60),
            retry_attempts: 2,
        }
    }
}

impl EngineConfig {
    pub fn with_task_slots(mut self, slots: usize) -> Self {
        self.task_slots = slots;
        self
    }

    pub fn with_min_pause(mut self, pause: Duration) -> Self {
        self.min_pause = pause;
        self
    }

    pub fn with_job_loop_max_pause(mut self, pause: Duration) -> Self {
        self.job_loop_max_pause = pause;
        self
    }

    pub fn with_task_loop_max_pause(mut self, pause: Duration) -> Self {
        self.task_loop_max_pause = pause;
        self
    }

    pub fn with_expiry_window(mut self, window: Duration) -> Self {
        self.expiry_window = window;
        self
    }

    pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts)
    }

    /// Defaults overridden by `DAGOPS_*` environment variables.
    ///
    /// | variable | unit |
    /// |----------|------|
    /// | `DAGOPS_TASK_SLOTS` | count |
    /// | `DAGOPS_MIN_PAUSE_MS` | milliseconds |
    /// | `DAGOPS_JOB_LOOP_MAX_PAUSE_MS` | milliseconds |
    /// | `DAGOPS_TASK_LOOP_MAX_PAUSE_MS` | milliseconds |
    /// | `DAGOPS_EXPIRY_WINDOW_SECS` | seconds |
    /// | `DAGOPS_EXPIRY_INTERVAL_SECS` | seconds |
    /// | `DAGOPS_RETRY_ATTEMPTS` | count |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parse(&lookup, key, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };
        let secs = |key: &str, default: Duration| {
            parse(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        Self {
            task_slots: parse(&lookup, "DAGOPS_TASK_SLOTS", defaults.task_slots)
                .unwrap_or(defaults.task_slots),
            min_pause: millis("DAGOPS_MIN_PAUSE_MS", defaults.min_pause),
            job_loop_max_pause: millis("DAGOPS_JOB_LOOP_MAX_PAUSE_MS", defaults.job_loop_max_pause),
            task_loop_max_pause: millis(
                "DAGOPS_TASK_LOOP_MAX_PAUSE_MS",
                defaults.task_loop_max_pause,
            ),
            expiry_window: secs("DAGOPS_EXPIRY_WINDOW_SECS", defaults.expiry_window),
            expiry_interval: secs("DAGOPS_EXPIRY_INTERVAL_SECS", defaults.expiry_interval),
            retry_attempts: parse(&lookup, "DAGOPS_RETRY_ATTEMPTS", defaults.retry_attempts)
                .unwrap_or(defaults.retry_attempts),
        }
    }
}

/// `None` when the variable is unset or unparsable (the latter is logged).
fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Option<T>
where
    T: FromStr + std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, default = %default, "ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.task_slots, 10);
        assert_eq!(config.job_loop_max_pause, Duration::from_secs(5));
        assert_eq!(config.task_loop_max_pause, Duration::from_secs(30));
        assert_eq!(config.expiry_window, Duration::from_secs(900));
        assert_eq!(config.retry_policy().max_attempts, 2);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DAGOPS_TASK_SLOTS", "4"),
            ("DAGOPS_MIN_PAUSE_MS", "250"),
            ("DAGOPS_EXPIRY_WINDOW_SECS", " 60 "),
        ]));
        assert_eq!(config.task_slots, 4);
        assert_eq!(config.min_pause, Duration::from_millis(250));
        assert_eq!(config.expiry_window, Duration::from_secs(60));
        assert_eq!(config.expiry_interval, Duration::from_secs(60));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DAGOPS_TASK_SLOTS", "many"),
            ("DAGOPS_RETRY_ATTEMPTS", "-1"),
        ]));
        assert_eq!(config, EngineConfig::default());
    }
}
