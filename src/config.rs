//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Batch size used when no override is configured for reset runs.
pub const DEFAULT_RESET_BATCH_SIZE: u64 = 500;

/// Seeder service configuration.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    /// Path of the libSQL database holding progress records.
    pub db_path: PathBuf,
    /// Port of the REST server.
    pub port: u16,
    /// Items deleted per step during single-job and reset-all runs.
    pub reset_batch_size: u64,
    /// Pause between job and reset steps in the client controller.
    pub step_delay: Duration,
    /// Pause between reset-all steps in the client controller.
    pub reset_all_step_delay: Duration,
    /// Interval of the global "is anything running" poller.
    pub global_poll_interval: Duration,
    /// Mark records left in `running` by a previous process as cancelled.
    pub recover_on_startup: bool,
    /// Optional directory for a daily rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/data-seeder.db"),
            port: 8080,
            reset_batch_size: DEFAULT_RESET_BATCH_SIZE,
            step_delay: Duration::from_millis(100),
            reset_all_step_delay: Duration::from_millis(50),
            global_poll_interval: Duration::from_millis(2000),
            recover_on_startup: true,
            log_dir: None,
        }
    }
}

impl SeederConfig {
    /// Build config from `SEEDER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("SEEDER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("SEEDER_PORT") {
            config.port = parse_value("SEEDER_PORT", &port)?;
        }
        if let Some(size) = lookup("SEEDER_RESET_BATCH_SIZE") {
            let size: u64 = parse_value("SEEDER_RESET_BATCH_SIZE", &size)?;
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "SEEDER_RESET_BATCH_SIZE".into(),
                    message: "must be greater than zero".into(),
                });
            }
            config.reset_batch_size = size;
        }
        if let Some(ms) = lookup("SEEDER_STEP_DELAY_MS") {
            config.step_delay = Duration::from_millis(parse_value("SEEDER_STEP_DELAY_MS", &ms)?);
        }
        if let Some(ms) = lookup("SEEDER_RESET_ALL_STEP_DELAY_MS") {
            config.reset_all_step_delay =
                Duration::from_millis(parse_value("SEEDER_RESET_ALL_STEP_DELAY_MS", &ms)?);
        }
        if let Some(ms) = lookup("SEEDER_GLOBAL_POLL_MS") {
            let ms: u64 = parse_value("SEEDER_GLOBAL_POLL_MS", &ms)?;
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "SEEDER_GLOBAL_POLL_MS".into(),
                    message: "must be greater than zero".into(),
                });
            }
            config.global_poll_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup("SEEDER_RECOVER_ON_STARTUP") {
            config.recover_on_startup = parse_bool("SEEDER_RECOVER_ON_STARTUP", &flag)?;
        }
        if let Some(dir) = lookup("SEEDER_LOG_DIR").filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = SeederConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.reset_batch_size, 500);
        assert_eq!(config.step_delay, Duration::from_millis(100));
        assert_eq!(config.global_poll_interval, Duration::from_secs(2));
        assert!(config.recover_on_startup);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = SeederConfig::from_lookup(lookup_from(&[
            ("SEEDER_PORT", "9090"),
            ("SEEDER_RESET_BATCH_SIZE", "25"),
            ("SEEDER_STEP_DELAY_MS", "5"),
            ("SEEDER_RECOVER_ON_STARTUP", "off"),
            ("SEEDER_DB_PATH", "/tmp/seed.db"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.reset_batch_size, 25);
        assert_eq!(config.step_delay, Duration::from_millis(5));
        assert!(!config.recover_on_startup);
        assert_eq!(config.db_path, PathBuf::from("/tmp/seed.db"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SeederConfig::from_lookup(lookup_from(&[("SEEDER_PORT", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SEEDER_PORT"));

        let err = SeederConfig::from_lookup(lookup_from(&[("SEEDER_RESET_BATCH_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = SeederConfig::from_lookup(lookup_from(&[("SEEDER_RECOVER_ON_STARTUP", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
