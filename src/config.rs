//! Configuration for quizlink

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::{default_rules, TopicClassifier, TopicRule, GENERAL_TOPIC};
use crate::db::links::DEFAULT_CODE_TTL_SECS;
use crate::error::StorageError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quizlink")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and the config file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file; defaults to `<data_dir>/quizlink.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Lifetime of a verification code in seconds
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: i64,

    /// How often expired codes are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// Outbound notifications to the bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Bot API base URL. Only scheme, host and port are used.
    /// Notifications are disabled when unset.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_notify_timeout")]
    pub timeout_ms: u64,

    /// Sent as `Authorization: Bearer <token>` when set
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Topic rules. An empty rule list means the built-in syllabus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_fallback_topic")]
    pub fallback: String,

    #[serde(default)]
    pub rules: Vec<TopicRule>,
}

fn default_http_port() -> u16 {
    8095
}

fn default_code_ttl() -> i64 {
    DEFAULT_CODE_TTL_SECS
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_notify_timeout() -> u64 {
    2000
}

fn default_fallback_topic() -> String {
    GENERAL_TOPIC.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            http_port: default_http_port(),
            code_ttl_secs: default_code_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            notifier: NotifierConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_notify_timeout(),
            auth_token: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback_topic(),
            rules: Vec::new(),
        }
    }
}

impl ClassifierConfig {
    /// Build the classifier these settings describe
    pub fn build(&self) -> TopicClassifier {
        let rules = if self.rules.is_empty() {
            default_rules()
        } else {
            self.rules.clone()
        };
        TopicClassifier::new(rules, self.fallback.clone())
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.code_ttl_secs <= 0 {
            return Err(StorageError::Config(format!(
                "code_ttl_secs must be positive, got {}",
                self.code_ttl_secs
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(StorageError::Config("sweep_interval_secs must be positive".to_string()));
        }
        if self.notifier.timeout_ms == 0 {
            return Err(StorageError::Config("notifier.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("quizlink.db"))
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
