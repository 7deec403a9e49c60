//! Config - マネージャー設定（TOML）
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Overrides `base_url` when set.
pub const BASE_URL_ENV: &str = "OPGRAPH_BASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid base url '{url}': {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// What a full reset does with the root workspace's uncommitted changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Keep them.
    #[default]
    Preserve,
    /// Drop them.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            user_agent: concat!("opgraph/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Used in task names and logs.
    pub name: String,
    pub base_url: String,
    /// Partitions of one transaction running at once (unset = unbounded).
    pub partition_concurrency: Option<usize>,
    /// TTL for entities without `timeToLive` metadata.
    pub default_ttl_secs: f64,
    pub reset_policy: ResetPolicy,
    pub transport: TransportConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "opgraph".to_string(),
            base_url: "http://localhost/".to_string(),
            partition_concurrency: None,
            default_ttl_secs: 0.0,
            reset_policy: ResetPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Apply `OPGRAPH_BASE_URL` if it is set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(base_url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url;
        }
        self
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|source| ConfigError::BaseUrl {
            url: self.base_url.clone(),
            source,
        })
    }
}
