//! Configuration loader and validator for the referral desk.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::lifecycle::{IntegrationRegistry, ReferralPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub referrals: Referrals,
    pub jobs: Jobs,
    #[serde(default)]
    pub events: Events,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides `{data_dir}/referrals.db` when set.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Referral lifecycle policy and integration registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Referrals {
    pub default_currency: String,
    #[serde(default)]
    pub allow_self_referral: bool,
    #[serde(default)]
    pub allow_zero_amount: bool,
    #[serde(default)]
    pub min_amount: f64,
    #[serde(default)]
    pub integrations: Vec<Integration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integration {
    pub context: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Batch job runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jobs {
    pub per_step: u32,
    pub lease_seconds: u64,
}

/// Domain event delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Events {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_token: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        self.app.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}/referrals.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn policy(&self) -> ReferralPolicy {
        ReferralPolicy {
            default_currency: self.referrals.default_currency.clone(),
            allow_self_referral: self.referrals.allow_self_referral,
            allow_zero_amount: self.referrals.allow_zero_amount,
            min_amount: self.referrals.min_amount,
        }
    }

    pub fn integration_registry(&self) -> IntegrationRegistry {
        let mut registry = IntegrationRegistry::default();
        for integration in &self.referrals.integrations {
            registry.register(&integration.context, integration.enabled);
        }
        registry
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if let Some(url) = &cfg.app.database_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("app.database_url must be non-empty when set"));
        }
    }

    if cfg.referrals.default_currency.trim().is_empty() {
        return Err(ConfigError::Invalid("referrals.default_currency must be non-empty"));
    }
    if !cfg.referrals.min_amount.is_finite() || cfg.referrals.min_amount < 0.0 {
        return Err(ConfigError::Invalid("referrals.min_amount must be a finite value >= 0"));
    }
    for integration in &cfg.referrals.integrations {
        if integration.context.trim().is_empty() {
            return Err(ConfigError::Invalid("referrals.integrations[].context must be non-empty"));
        }
    }

    if cfg.jobs.per_step == 0 {
        return Err(ConfigError::Invalid("jobs.per_step must be > 0"));
    }
    if cfg.jobs.lease_seconds == 0 {
        return Err(ConfigError::Invalid("jobs.lease_seconds must be > 0"));
    }

    if let Some(url) = &cfg.events.webhook_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("events.webhook_url must be non-empty when set"));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

referrals:
  default_currency: "usd"
  allow_self_referral: false
  allow_zero_amount: false
  min_amount: 0.0
  integrations:
    - context: "shop"
    - context: "woocommerce"
    - context: "legacy_forms"
      enabled: false

jobs:
  per_step: 100
  lease_seconds: 30

events:
  webhook_url: "https://hooks.example.com/referrals"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.referrals.integrations.len(), 3);
        assert!(cfg.referrals.integrations[0].enabled);
        assert!(!cfg.referrals.integrations[2].enabled);
    }

    #[test]
    fn events_section_is_optional() {
        let yaml = example().split("events:").next().unwrap();
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.events, Events::default());
    }

    #[test]
    fn invalid_currency() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.referrals.default_currency = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("default_currency")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_job_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.jobs.per_step = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(msg)) if msg.contains("per_step")));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.jobs.lease_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_min_amount() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.referrals.min_amount = -1.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.referrals.min_amount = f64::NAN;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn registry_reflects_enabled_flags() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let registry = cfg.integration_registry();
        assert!(registry.is_enabled("shop"));
        assert!(!registry.is_enabled("legacy_forms"));
        assert!(!registry.is_enabled("unknown"));
    }

    #[test]
    fn database_url_defaults_under_data_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.database_url(), "sqlite://./data/referrals.db");
        cfg.app.database_url = Some("sqlite::memory:".into());
        assert_eq!(cfg.database_url(), "sqlite::memory:");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.jobs.per_step, 100);
        assert_eq!(cfg.policy().default_currency, "usd");
    }
}
