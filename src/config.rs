use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_RETRY_MAX: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 20;
pub const DEFAULT_MAX_FACTS: i32 = -1;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub retry_max: Option<u32>,
    #[serde(default)]
    pub retry_interval: Option<u64>,
    #[serde(default)]
    pub min_donors: Option<u32>,
    #[serde(default)]
    pub max_facts: Option<i32>,
    #[serde(default)]
    pub star_model: Option<bool>,
    #[serde(default)]
    pub mock_registry: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub transport: Option<Transport>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Rest,
    Graphql,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub registry_url: String,
    pub source_url: String,
    /// `None` means sync is intentionally disabled: the pre-flight check
    /// skips the pass without reporting an error.
    pub credentials: Option<Credentials>,
    pub transport: Transport,
    pub retry_max: u32,
    pub retry_interval_secs: u64,
    pub min_donors: u32,
    /// Negative means unlimited.
    pub max_facts: i32,
    pub star_model: bool,
    pub mock_registry: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("registry-sync.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let retry_max = config.retry_max.unwrap_or(DEFAULT_RETRY_MAX);
        if retry_max == 0 {
            return Err(SyncError::ConfigValue {
                field: "retryMax".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let min_donors = config.min_donors.unwrap_or(crate::dataset::DEFAULT_MIN_DONORS);

        let username = config
            .registry
            .username
            .or_else(|| non_empty_env("REGISTRY_USER"));
        let password = config
            .registry
            .password
            .or_else(|| non_empty_env("REGISTRY_PASS"));
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            registry_url: config
                .registry
                .url
                .unwrap_or_else(|| "https://directory.bbmri-eric.eu".to_string()),
            source_url: config
                .source
                .url
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            credentials,
            transport: config.registry.transport.unwrap_or_default(),
            retry_max,
            retry_interval_secs: config
                .retry_interval
                .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
            min_donors,
            max_facts: config.max_facts.unwrap_or(DEFAULT_MAX_FACTS),
            star_model: config.star_model.unwrap_or(true),
            mock_registry: config.mock_registry.unwrap_or(false),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.retry_max, DEFAULT_RETRY_MAX);
        assert_eq!(resolved.retry_interval_secs, DEFAULT_RETRY_INTERVAL_SECS);
        assert_eq!(resolved.min_donors, 10);
        assert_eq!(resolved.max_facts, -1);
        assert_eq!(resolved.transport, Transport::Rest);
        assert!(resolved.star_model);
        assert!(!resolved.mock_registry);
    }

    #[test]
    fn missing_credentials_disable_sync() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        // No file credentials and (in the test environment) no env vars.
        if std::env::var("REGISTRY_USER").is_err() || std::env::var("REGISTRY_PASS").is_err() {
            assert_eq!(resolved.credentials, None);
        }
    }

    #[test]
    fn file_credentials_are_used() {
        let config = Config {
            registry: RegistryConfig {
                username: Some("sync-user".to_string()),
                password: Some("secret".to_string()),
                ..RegistryConfig::default()
            },
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(
            resolved.credentials,
            Some(Credentials {
                username: "sync-user".to_string(),
                password: "secret".to_string(),
            })
        );
    }

    #[test]
    fn zero_retries_is_rejected() {
        let config = Config {
            retry_max: Some(0),
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SyncError::ConfigValue { .. });
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "registry": {"url": "https://reg.example", "transport": "graphql"},
            "source": {"url": "http://store.example"},
            "retryMax": 2,
            "retryInterval": 1,
            "minDonors": 5,
            "maxFacts": 100,
            "starModel": false,
            "mockRegistry": true
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.registry_url, "https://reg.example");
        assert_eq!(resolved.transport, Transport::Graphql);
        assert_eq!(resolved.retry_max, 2);
        assert_eq!(resolved.min_donors, 5);
        assert_eq!(resolved.max_facts, 100);
        assert!(!resolved.star_model);
        assert!(resolved.mock_registry);
    }
}
