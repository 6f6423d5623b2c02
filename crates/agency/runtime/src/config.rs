//! Configuration for the agency runtime

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AgencyError;

/// Main agency configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgencyConfig {
    /// Messaging configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Journal configuration
    #[serde(default)]
    pub journal: JournalConfig,

    /// Default retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgencyConfig {
    /// Load configuration from defaults, an optional file and the
    /// environment (`AGENCY_` prefix, `__` between nested keys).
    pub fn load(path: Option<&str>) -> Result<Self, AgencyError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&AgencyConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AGENCY")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

/// Messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Expiration applied to messages sent without one, in seconds
    #[serde(default = "default_message_timeout")]
    pub default_timeout: f64,

    /// Shard agents bind to
    #[serde(default = "default_shard")]
    pub shard: String,
}

fn default_message_timeout() -> f64 {
    10.0
}

fn default_shard() -> String {
    "lobby".to_string()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_message_timeout(),
            shard: default_shard(),
        }
    }
}

/// Where journal entries are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeeperKind {
    #[default]
    Memory,
    File,
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Record agent calls
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub keeper: KeeperKind,

    /// Journal file, used by the file keeper
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("agency.journal")
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keeper: KeeperKind::Memory,
            path: default_journal_path(),
        }
    }
}

/// Default backoff for retried protocols
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,

    /// Upper bound of the doubling delay
    #[serde(default)]
    pub max_delay: Option<f64>,

    /// Unlimited when unset
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_initial_delay() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: None,
            max_retries: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgencyConfig::default();
        assert_eq!(config.messaging.default_timeout, 10.0);
        assert_eq!(config.messaging.shard, "lobby");
        assert!(config.journal.enabled);
        assert_eq!(config.journal.keeper, KeeperKind::Memory);
        assert_eq!(config.retry.initial_delay, 1.0);
        assert!(config.retry.max_retries.is_none());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agency.toml");
        std::fs::write(
            &path,
            "[messaging]\nshard = \"tests\"\n\n[retry]\nmax_retries = 3\n",
        )
        .unwrap();

        let config = AgencyConfig::load(path.to_str()).unwrap();
        assert_eq!(config.messaging.shard, "tests");
        assert_eq!(config.messaging.default_timeout, 10.0);
        assert_eq!(config.retry.max_retries, Some(3));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = AgencyConfig::load(Some("/nonexistent/agency")).unwrap();
        assert_eq!(config.messaging.shard, "lobby");
    }
}
