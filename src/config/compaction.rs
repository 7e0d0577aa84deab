//! Workflow history compaction configuration.
//!
//! # Example
//!
//! ```toml
//! [compaction]
//! minimum_age_hours = 24
//! time_window_hours = 1
//! batch_size = 1000
//! batch_delay_ms = 1000
//! ```
//!
//! The four tuning knobs can also be overridden from the environment, which
//! takes precedence over the file:
//!
//! | Key | Variable |
//! |-----|----------|
//! | `minimum_age_hours` | `WORKFLOW_HISTORY_COMPACTING_MINIMUM_AGE_HOURS` |
//! | `time_window_hours` | `WORKFLOW_HISTORY_COMPACTING_TIME_WINDOW_HOURS` |
//! | `batch_size` | `WORKFLOW_HISTORY_COMPACTING_BATCH_SIZE` |
//! | `batch_delay_ms` | `WORKFLOW_HISTORY_COMPACTING_BATCH_DELAY_MS` |
//!
//! Each variable is also read with an `N8N_` prefix, as older deployments set
//! it. The unprefixed name wins when both are present.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

pub const ENV_MINIMUM_AGE_HOURS: &str = "WORKFLOW_HISTORY_COMPACTING_MINIMUM_AGE_HOURS";
pub const ENV_TIME_WINDOW_HOURS: &str = "WORKFLOW_HISTORY_COMPACTING_TIME_WINDOW_HOURS";
pub const ENV_BATCH_SIZE: &str = "WORKFLOW_HISTORY_COMPACTING_BATCH_SIZE";
pub const ENV_BATCH_DELAY_MS: &str = "WORKFLOW_HISTORY_COMPACTING_BATCH_DELAY_MS";
/// Prefix accepted in front of every `ENV_*` name.
pub const LEGACY_ENV_PREFIX: &str = "N8N_";

/// Compaction of superseded workflow versions.
///
/// Every `time_window_hours` the leader prunes versions that were created in
/// a window of that length ending `minimum_age_hours` ago.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompactionConfig {
    /// Whether the scheduler may run at all.
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Versions younger than this are never considered.
    /// Default: 24
    #[serde(default = "default_minimum_age_hours")]
    pub minimum_age_hours: u64,

    /// Length of each compaction window, and the interval between cycles.
    /// Default: 1
    #[serde(default = "default_time_window_hours")]
    pub time_window_hours: u64,

    /// Versions inspected before the cycle pauses for `batch_delay_ms`.
    /// Default: 1000
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Pause length once `batch_size` versions have been inspected.
    /// Default: 1000
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Only count what would be deleted.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// How many later cycles retry a workflow whose pruning failed.
    /// Set to 0 to drop failures immediately.
    /// Default: 3
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_age_hours: default_minimum_age_hours(),
            time_window_hours: default_time_window_hours(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            dry_run: false,
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl CompactionConfig {
    pub fn minimum_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.minimum_age_hours as i64)
    }

    pub fn time_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.time_window_hours as i64)
    }

    /// Timer period between cycles.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.time_window_hours * 3600)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Apply `WORKFLOW_HISTORY_COMPACTING_*` variables on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_u64(ENV_MINIMUM_AGE_HOURS)? {
            self.minimum_age_hours = v;
        }
        if let Some(v) = env_u64(ENV_TIME_WINDOW_HOURS)? {
            self.time_window_hours = v;
        }
        if let Some(v) = env_u64(ENV_BATCH_SIZE)? {
            self.batch_size = v;
        }
        if let Some(v) = env_u64(ENV_BATCH_DELAY_MS)? {
            self.batch_delay_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_window_hours == 0 {
            return Err(ConfigError::Validation(
                "compaction.time_window_hours must be at least 1".into(),
            ));
        }
        // Hours beyond this overflow chrono durations
        const MAX_HOURS: u64 = 24 * 365 * 100;
        if self.minimum_age_hours > MAX_HOURS || self.time_window_hours > MAX_HOURS {
            return Err(ConfigError::Validation(format!(
                "compaction hours must not exceed {}",
                MAX_HOURS
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "compaction.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_u64(var: &str) -> Result<Option<u64>, ConfigError> {
    let legacy = format!("{LEGACY_ENV_PREFIX}{var}");
    let Some((name, value)) = [var, legacy.as_str()]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().map(|value| (name, value)))
    else {
        return Ok(None);
    };

    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnvOverride {
            var: name.to_string(),
            value,
        })
}

fn default_true() -> bool {
    true
}

fn default_minimum_age_hours() -> u64 {
    24
}

fn default_time_window_hours() -> u64 {
    1
}

fn default_batch_size() -> u64 {
    1000
}

fn default_batch_delay_ms() -> u64 {
    1000
}

fn default_max_retry_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: [&str; 4] = [
        ENV_MINIMUM_AGE_HOURS,
        ENV_TIME_WINDOW_HOURS,
        ENV_BATCH_SIZE,
        ENV_BATCH_DELAY_MS,
    ];

    fn legacy(var: &str) -> String {
        format!("{LEGACY_ENV_PREFIX}{var}")
    }

    /// Every override variable, prefixed or not.
    fn all_vars() -> Vec<String> {
        ALL_VARS
            .iter()
            .flat_map(|var| [var.to_string(), legacy(var)])
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = CompactionConfig::default();
        assert!(config.enabled);
        assert!(!config.dry_run);
        assert_eq!(config.minimum_age_hours, 24);
        assert_eq!(config.time_window_hours, 1);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.batch_delay_ms, 1000);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.period(), Duration::from_millis(3_600_000));
        assert_eq!(config.batch_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_partial() {
        let config: CompactionConfig = toml::from_str(
            r#"
            minimum_age_hours = 48
            dry_run = true
        "#,
        )
        .unwrap();
        assert_eq!(config.minimum_age_hours, 48);
        assert_eq!(config.minimum_age(), chrono::Duration::hours(48));
        assert!(config.dry_run);
        assert_eq!(config.time_window_hours, 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<CompactionConfig, _> = toml::from_str("batch = 10");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                (ENV_MINIMUM_AGE_HOURS, Some("12")),
                (ENV_TIME_WINDOW_HOURS, Some("2")),
                (ENV_BATCH_SIZE, Some(" 500 ")),
                (ENV_BATCH_DELAY_MS, Some("250")),
            ],
            || {
                let mut config = CompactionConfig::default();
                config.apply_env_overrides().unwrap();
                assert_eq!(config.minimum_age_hours, 12);
                assert_eq!(config.time_window_hours, 2);
                assert_eq!(config.batch_size, 500);
                assert_eq!(config.batch_delay_ms, 250);
                assert_eq!(config.period(), Duration::from_secs(7200));
            },
        );
    }

    #[test]
    fn test_env_overrides_absent_keep_values() {
        temp_env::with_vars_unset(all_vars(), || {
            let mut config = CompactionConfig {
                batch_size: 42,
                ..Default::default()
            };
            config.apply_env_overrides().unwrap();
            assert_eq!(config.batch_size, 42);
        });
    }

    #[test]
    fn test_prefixed_env_overrides() {
        temp_env::with_vars(
            [
                (legacy(ENV_MINIMUM_AGE_HOURS), Some("48")),
                (legacy(ENV_BATCH_DELAY_MS), Some("10")),
                (ENV_MINIMUM_AGE_HOURS.to_string(), None),
                (ENV_BATCH_DELAY_MS.to_string(), None),
            ],
            || {
                let mut config = CompactionConfig::default();
                config.apply_env_overrides().unwrap();
                assert_eq!(config.minimum_age_hours, 48);
                assert_eq!(config.batch_delay_ms, 10);
            },
        );
    }

    #[test]
    fn test_unprefixed_env_wins() {
        temp_env::with_vars(
            [
                (legacy(ENV_BATCH_SIZE), Some("lots")),
                (ENV_BATCH_SIZE.to_string(), Some("300")),
            ],
            || {
                let mut config = CompactionConfig::default();
                config.apply_env_overrides().unwrap();
                assert_eq!(config.batch_size, 300);
            },
        );
    }

    #[test]
    fn test_prefixed_env_override_invalid() {
        temp_env::with_vars(
            [
                (legacy(ENV_TIME_WINDOW_HOURS), Some("soon")),
                (ENV_TIME_WINDOW_HOURS.to_string(), None),
            ],
            || {
                let err = CompactionConfig::default()
                    .apply_env_overrides()
                    .unwrap_err();
                assert!(matches!(
                    err,
                    ConfigError::InvalidEnvOverride { ref var, .. }
                        if *var == legacy(ENV_TIME_WINDOW_HOURS)
                ));
            },
        );
    }

    #[test]
    fn test_env_override_invalid() {
        temp_env::with_var(ENV_BATCH_SIZE, Some("lots"), || {
            let err = CompactionConfig::default()
                .apply_env_overrides()
                .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidEnvOverride { ref var, ref value }
                    if var == ENV_BATCH_SIZE && value == "lots"
            ));
        });
    }

    #[test]
    fn test_validate() {
        assert!(CompactionConfig::default().validate().is_ok());

        let zero_window = CompactionConfig {
            time_window_hours: 0,
            ..Default::default()
        };
        assert!(zero_window.validate().is_err());

        let zero_batch = CompactionConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let huge_age = CompactionConfig {
            minimum_age_hours: u64::MAX,
            ..Default::default()
        };
        assert!(huge_age.validate().is_err());

        let no_age = CompactionConfig {
            minimum_age_hours: 0,
            ..Default::default()
        };
        assert!(no_age.validate().is_ok());
    }
}
