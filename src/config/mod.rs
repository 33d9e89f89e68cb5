use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protection::DEFAULT_PROTECTED_FILES_LIMIT;

const CONFIG_BASENAME: &str = "patch-status";
const ENV_PREFIX: &str = "PATCH_STATUS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Runtime settings for the checker and CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite database holding repositories, pull requests and protection rules
    pub database_path: PathBuf,
    /// Pull requests evaluated concurrently
    pub workers: usize,
    /// Retries after a failed evaluation before giving up
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Cap on recorded changed protected files per pull request
    pub protected_files_limit: usize,
    /// Default filter when RUST_LOG is not set
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".patch-status/patch-status.db"),
            workers: 4,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            protected_files_limit: DEFAULT_PROTECTED_FILES_LIMIT,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Exponential backoff owned by the checker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Settings::default().retry_policy()
    }
}

impl Settings {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. `patch-status.toml` in the working directory, or `explicit` when given
    /// 3. Environment variables prefixed with `PATCH_STATUS_`
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with_env(explicit, None)
    }

    /// Like [`Settings::load`], reading environment overrides from `env` instead of the process when given.
    pub fn load_with_env(
        explicit: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();

        builder = match explicit {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(CONFIG_BASENAME).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.workers == 0 {
            return Err(SettingsError::Invalid("workers must be at least 1".to_string()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(SettingsError::Invalid(
                "retry_base_delay_ms exceeds retry_max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn no_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn defaults_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch-status.toml");
        fs::write(&path, "").unwrap();

        let settings = Settings::load_with_env(Some(&path), no_env()).unwrap();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.protected_files_limit, 10);
        assert_eq!(settings.log_format, LogFormat::Pretty);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch-status.toml");
        fs::write(
            &path,
            "workers = 2\ndatabase_path = \"/tmp/x.db\"\nlog_format = \"json\"\n",
        )
        .unwrap();

        let settings = Settings::load_with_env(Some(&path), no_env()).unwrap();
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.max_retries, 3);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch-status.toml");
        fs::write(&path, "workers = 2\n").unwrap();

        let env = HashMap::from([
            ("PATCH_STATUS_WORKERS".to_string(), "8".to_string()),
            ("PATCH_STATUS_MAX_RETRIES".to_string(), "0".to_string()),
        ]);
        let settings = Settings::load_with_env(Some(&path), Some(env)).unwrap();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.max_retries, 0);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch-status.toml");
        fs::write(&path, "workers = 0\n").unwrap();

        assert!(matches!(
            Settings::load_with_env(Some(&path), no_env()),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Settings::load_with_env(Some(&path), no_env()),
            Err(SettingsError::Load(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }
}
