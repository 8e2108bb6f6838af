use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::categorizer::CategorizerSettings;
use crate::error::{CategorizerError, Result};
use crate::label_resolver::is_reserved_label_name;
use crate::models::CategorySet;
use crate::orchestrator::OrchestratorSettings;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "GMAIL_CATEGORIZER_";

/// Largest batch a single run may request
pub const MAX_MESSAGES_LIMIT: usize = 500;
pub const MAX_CONCURRENCY: usize = 20;

/// Category lists longer than this still work but make prompts noisy
const CATEGORY_WARN_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_max_messages")]
    pub max_messages_per_batch: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub min_label_confidence: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            max_messages_per_batch: default_max_messages(),
            concurrency: default_concurrency(),
            min_label_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u16,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Read from the file or `OPENAI_API_KEY`; never written back
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_prompt_chars: default_max_prompt_chars(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabelConfig {
    /// Parent label for category labels, e.g. `AI` gives `AI/Work`
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_quota_units_per_second")]
    pub quota_units_per_second: u32,
    #[serde(default = "default_burst_units")]
    pub burst_units: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota_units_per_second: default_quota_units_per_second(),
            burst_units: default_burst_units(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write logs here instead of the terminal
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            json: false,
        }
    }
}

fn default_query() -> String {
    "in:inbox".to_string()
}

fn default_max_messages() -> usize {
    50
}

fn default_concurrency() -> usize {
    5
}

fn default_categories() -> Vec<String> {
    [
        "Work",
        "Personal",
        "Finance",
        "Shopping",
        "Newsletter",
        "Social",
        "Promotions",
        "Other",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u16 {
    150
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_prompt_chars() -> usize {
    3000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_quota_units_per_second() -> u32 {
    250
}

fn default_burst_units() -> u32 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        CategorizerError::ConfigError(format!(
            "{}{} has an invalid value: '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

impl Config {
    /// Load from `path`, apply environment overrides and validate
    ///
    /// A missing file is not an error; defaults are used instead.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                CategorizerError::ConfigError(format!("Failed to read config file: {}", e))
            })?;

            let config: Self = toml::from_str(&content).map_err(|e| {
                CategorizerError::ConfigError(format!("Failed to parse config file: {}", e))
            })?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `GMAIL_CATEGORIZER_*` variables and `OPENAI_API_KEY`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(query) = env_var("QUERY") {
            self.processing.query = query;
        }
        if let Some(value) = env_var("MAX_MESSAGES") {
            self.processing.max_messages_per_batch = parse_env("MAX_MESSAGES", &value)?;
        }
        if let Some(value) = env_var("CONCURRENCY") {
            self.processing.concurrency = parse_env("CONCURRENCY", &value)?;
        }
        if let Some(value) = env_var("CATEGORIES") {
            self.classification.categories = value
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(model) = env_var("MODEL") {
            self.classification.model = model;
        }
        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.level = level;
        }

        if self.classification.api_key.is_none() {
            self.classification.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let processing = &self.processing;
        if processing.query.trim().is_empty() {
            return Err(CategorizerError::ConfigError(
                "processing.query cannot be empty".to_string(),
            ));
        }
        if processing.max_messages_per_batch == 0
            || processing.max_messages_per_batch > MAX_MESSAGES_LIMIT
        {
            return Err(CategorizerError::ConfigError(format!(
                "processing.max_messages_per_batch must be between 1 and {}",
                MAX_MESSAGES_LIMIT
            )));
        }
        if processing.concurrency == 0 || processing.concurrency > MAX_CONCURRENCY {
            return Err(CategorizerError::ConfigError(format!(
                "processing.concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }
        if !(0.0..=1.0).contains(&processing.min_label_confidence) {
            return Err(CategorizerError::ConfigError(
                "processing.min_label_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }

        let classification = &self.classification;
        self.category_set()?;
        if classification.categories.len() > CATEGORY_WARN_THRESHOLD {
            tracing::warn!(
                "{} categories configured; classification accuracy may suffer",
                classification.categories.len()
            );
        }
        if classification.model.trim().is_empty() {
            return Err(CategorizerError::ConfigError(
                "classification.model cannot be empty".to_string(),
            ));
        }
        if classification.max_tokens == 0 {
            return Err(CategorizerError::ConfigError(
                "classification.max_tokens must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&classification.temperature) {
            return Err(CategorizerError::ConfigError(
                "classification.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if classification.max_prompt_chars < 100 {
            return Err(CategorizerError::ConfigError(
                "classification.max_prompt_chars must be at least 100".to_string(),
            ));
        }

        match &self.labels.prefix {
            Some(prefix) if prefix.trim().trim_matches('/').is_empty() => {
                return Err(CategorizerError::ConfigError(
                    "labels.prefix cannot be blank when set".to_string(),
                ));
            }
            Some(_) => {}
            None => {
                if let Some(reserved) = classification
                    .categories
                    .iter()
                    .find(|c| is_reserved_label_name(c))
                {
                    return Err(CategorizerError::ConfigError(format!(
                        "Category '{}' clashes with a Gmail system label; rename it or set labels.prefix",
                        reserved.trim()
                    )));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(CategorizerError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(CategorizerError::ConfigError(
                "retry.max_delay_ms cannot be less than retry.base_delay_ms".to_string(),
            ));
        }

        if self.rate_limit.quota_units_per_second == 0 {
            return Err(CategorizerError::ConfigError(
                "rate_limit.quota_units_per_second must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(CategorizerError::ConfigError(format!(
                    "Invalid logging.level: '{}'. Must be 'debug', 'info', 'warn', or 'error'",
                    other
                )));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CategorizerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            CategorizerError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            CategorizerError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }

    pub fn category_set(&self) -> Result<CategorySet> {
        CategorySet::new(self.classification.categories.iter())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            attempt_timeout: match self.retry.call_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn categorizer_settings(&self) -> CategorizerSettings {
        CategorizerSettings {
            max_tokens: self.classification.max_tokens,
            temperature: self.classification.temperature,
            max_prompt_chars: self.classification.max_prompt_chars,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            concurrency: self.processing.concurrency,
            retry: self.retry_policy(),
            min_label_confidence: self.processing.min_label_confidence,
            label_prefix: self.labels.prefix.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::{NamedTempFile, TempDir};

    const ENV_KEYS: [&str; 7] = [
        "GMAIL_CATEGORIZER_QUERY",
        "GMAIL_CATEGORIZER_MAX_MESSAGES",
        "GMAIL_CATEGORIZER_CONCURRENCY",
        "GMAIL_CATEGORIZER_CATEGORIES",
        "GMAIL_CATEGORIZER_MODEL",
        "GMAIL_CATEGORIZER_LOG_LEVEL",
        "OPENAI_API_KEY",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.processing.query, "in:inbox");
        assert_eq!(config.processing.max_messages_per_batch, 50);
        assert_eq!(config.processing.concurrency, 5);
        assert_eq!(config.processing.min_label_confidence, 0.0);

        assert_eq!(config.classification.categories.len(), 8);
        assert!(config.classification.categories.contains(&"Other".to_string()));
        assert_eq!(config.classification.model, "gpt-4o-mini");
        assert_eq!(config.classification.max_tokens, 150);
        assert!(config.classification.api_key.is_none());

        assert!(config.labels.prefix.is_none());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.quota_units_per_second, 250);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_max_messages_bounds() {
        let mut config = Config::default();

        config.processing.max_messages_per_batch = 0;
        assert!(config.validate().is_err());

        config.processing.max_messages_per_batch = 501;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("between 1 and 500"));

        config.processing.max_messages_per_batch = 1;
        assert!(config.validate().is_ok());
        config.processing.max_messages_per_batch = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_concurrency_bounds() {
        let mut config = Config::default();

        config.processing.concurrency = 0;
        assert!(config.validate().is_err());

        config.processing.concurrency = 21;
        assert!(config.validate().is_err());

        config.processing.concurrency = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_categories() {
        let mut config = Config::default();

        config.classification.categories.clear();
        assert!(config.validate().is_err());

        config.classification.categories = vec!["Work".to_string(), "work".to_string()];
        assert!(config.validate().is_err());

        config.classification.categories = vec!["Work".to_string(), "  ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_temperature_and_confidence() {
        let mut config = Config::default();
        config.classification.temperature = 2.5;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("temperature"));

        let mut config = Config::default();
        config.processing.min_label_confidence = 1.5;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("min_label_confidence"));
    }

    #[test]
    fn test_config_validation_blank_prefix() {
        let mut config = Config::default();
        config.labels.prefix = Some(" / ".to_string());
        assert!(config.validate().is_err());

        config.labels.prefix = Some("AI".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_reserved_category_needs_prefix() {
        let mut config = Config::default();
        config.classification.categories = vec!["Work".to_string(), "spam".to_string()];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'spam' clashes with a Gmail system label"));

        config.labels.prefix = Some("AI".to_string());
        assert!(config.validate().is_ok());

        // Shipped defaults must label cleanly without a prefix
        assert!(Config::default().validate().is_ok());
        assert!(!Config::default()
            .classification
            .categories
            .iter()
            .any(|c| is_reserved_label_name(c)));
    }

    #[test]
    fn test_config_validation_retry_and_logging() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid logging.level"));

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.retry.call_timeout_secs = 0;
        config.labels.prefix = Some("AI".to_string());

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.attempt_timeout, None);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.label_prefix.as_deref(), Some("AI"));

        assert_eq!(config.categorizer_settings(), CategorizerSettings::default());
        assert_eq!(config.category_set().unwrap().len(), 8);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let mut config = Config::default();
        config.classification.api_key = Some("sk-secret".to_string());

        let serialized = toml::to_string_pretty(&config).unwrap();
        assert!(!serialized.contains("sk-secret"));
    }

    #[tokio::test]
    #[serial]
    async fn test_config_load_save_roundtrip() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.processing.query = "is:unread".to_string();
        config.labels.prefix = Some("AI".to_string());
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.processing.query, "is:unread");
        assert_eq!(loaded.labels.prefix.as_deref(), Some("AI"));
        assert_eq!(loaded.classification.categories, config.classification.categories);
    }

    #[tokio::test]
    #[serial]
    async fn test_config_load_nonexistent_returns_default() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).await.unwrap();

        assert_eq!(config.processing.max_messages_per_batch, 50);
    }

    #[tokio::test]
    #[serial]
    async fn test_config_load_invalid_toml() {
        clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(temp_file.path()).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    #[serial]
    async fn test_config_partial_with_defaults() {
        clear_env();
        let temp_file = NamedTempFile::new().unwrap();
        let partial_config = r#"
[processing]
concurrency = 10

[classification]
categories = ["Work", "Travel"]
"#;
        tokio::fs::write(temp_file.path(), partial_config).await.unwrap();

        let config = Config::load(temp_file.path()).await.unwrap();

        assert_eq!(config.processing.concurrency, 10);
        assert_eq!(config.classification.categories, vec!["Work", "Travel"]);
        assert_eq!(config.processing.query, "in:inbox");
        assert_eq!(config.classification.model, "gpt-4o-mini");
    }

    #[tokio::test]
    #[serial]
    async fn test_config_create_example() {
        clear_env();
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example(temp_file.path()).await.unwrap();
        let config = Config::load(temp_file.path()).await.unwrap();
        assert_eq!(config.processing.concurrency, 5);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("GMAIL_CATEGORIZER_QUERY", "label:unread");
        std::env::set_var("GMAIL_CATEGORIZER_MAX_MESSAGES", "25");
        std::env::set_var("GMAIL_CATEGORIZER_CATEGORIES", "Work, Travel,,Bills");
        std::env::set_var("OPENAI_API_KEY", "sk-env");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.processing.query, "label:unread");
        assert_eq!(config.processing.max_messages_per_batch, 25);
        assert_eq!(config.classification.categories, vec!["Work", "Travel", "Bills"]);
        assert_eq!(config.classification.api_key.as_deref(), Some("sk-env"));
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_number() {
        clear_env();
        std::env::set_var("GMAIL_CATEGORIZER_CONCURRENCY", "many");

        let mut config = Config::default();
        let result = config.apply_env_overrides();
        clear_env();

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("GMAIL_CATEGORIZER_CONCURRENCY"));
    }

    #[test]
    #[serial]
    fn test_file_api_key_wins_over_env() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "sk-env");

        let mut config = Config::default();
        config.classification.api_key = Some("sk-file".to_string());
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.classification.api_key.as_deref(), Some("sk-file"));
    }
}
