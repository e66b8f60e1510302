//! Configuration management for quotakeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::limit::PeriodLimitConfig;
use crate::verified::VerifiedConfig;

/// Environment variable prefix for overrides, e.g. `QUOTAKEEPER__STORE__URL`.
pub const ENV_PREFIX: &str = "QUOTAKEEPER";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named period limits
    #[serde(default)]
    pub limits: HashMap<String, PeriodLimitConfig>,

    /// Verification code defaults
    #[serde(default)]
    pub verified: VerifiedConfig,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl KeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply
    /// `QUOTAKEEPER__`-prefixed environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: KeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limit and the verification defaults.
    pub fn validate(&self) -> Result<()> {
        for (name, limit) in &self.limits {
            limit
                .validate()
                .map_err(|e| QuotaError::Config(format!("limit {}: {}", name, e)))?;
        }
        self.verified.validate()
    }

    /// Look up a named limit.
    pub fn limit(&self, name: &str) -> Option<&PeriodLimitConfig> {
        self.limits.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = KeeperConfig::default();
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert!(config.limits.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
store:
  url: redis://cache:6379/2
limits:
  sms:
    period_secs: 60
    quota: 5
    align: true
    key_prefix: "sms:"
  login:
    quota: 10
verified:
  key_prefix: "code:"
  quota: 3
  expiry_secs: 120
"#;
        let config = KeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.url, "redis://cache:6379/2");
        let sms = config.limit("sms").unwrap();
        assert_eq!(sms.period(), Duration::from_secs(60));
        assert_eq!(sms.quota, 5);
        assert!(sms.align);
        assert_eq!(sms.key_prefix, "sms:");

        let login = config.limit("login").unwrap();
        assert_eq!(login.period(), Duration::from_secs(1));
        assert!(!login.align);

        assert_eq!(config.verified.quota, 3);
        assert_eq!(config.verified.expiry(), Duration::from_secs(120));
    }

    #[test]
    fn test_from_yaml_rejects_zero_quota() {
        let yaml = r#"
limits:
  broken:
    period_secs: 10
    quota: 0
"#;
        let err = KeeperConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("quotakeeper-{}.yaml", std::process::id()));
        std::fs::write(&path, "limits:\n  api:\n    period_secs: 30\n    quota: 100\n").unwrap();

        let config = KeeperConfig::from_file(&path).unwrap();
        assert_eq!(config.limit("api").unwrap().quota, 100);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let err = KeeperConfig::from_file("/nonexistent/quotakeeper.yaml").unwrap_err();
        assert!(matches!(err, QuotaError::Io(_)));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = KeeperConfig::load(None).unwrap();
        assert!(config.validate().is_ok());
    }
}
