//! Configuration management for quotadb.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

use crate::error::{QuotaError, Result};

static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid table name pattern"));

/// Connection settings for the counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Store connection string, e.g. `sqlite://limits.db`
    #[serde(default)]
    pub url: String,

    /// Credential for stores that require one
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Name of the counter table
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Upper bound on pooled store connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a transaction waits on a locked store, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_table_name() -> String {
    "rate_limits".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl LimiterConfig {
    /// Create a configuration for the given store URL with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            table_name: default_table_name(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Check that the configuration can be used to open a store.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(QuotaError::Config("store url is required".to_string()));
        }
        validate_table_name(&self.table_name)?;
        if self.max_connections == 0 {
            return Err(QuotaError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reject table names that are not plain identifiers.
///
/// The table name is interpolated into SQL text, so only
/// `[A-Za-z_][A-Za-z0-9_]*` is accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    if TABLE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(QuotaError::InvalidTableName(name.to_string()))
    }
}
