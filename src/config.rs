//! YAML configuration for the registry and its backing store.
//!
//! ```yaml
//! version: "1.0"
//! dimension: 1536
//! store:
//!   backend: postgrest
//!   url: "https://project.supabase.co"
//!   api_key: "service-role-key"
//!   table: intent_embedding
//!   page_size: 1000
//! ```
//!
//! Omitting `store` selects the in-memory store. ANN build parameters are
//! compile-time constants in [`crate::ann`] and cannot be configured here.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IndexError;
use crate::store::{EmbeddingStore, InMemoryStore};

/// Dimensionality of `text-embedding-3-small` vectors.
pub const DEFAULT_DIMENSION: usize = 1536;

pub const ENV_DIMENSION: &str = "TENANT_ANN_DIMENSION";
pub const ENV_POSTGREST_URL: &str = "TENANT_ANN_POSTGREST_URL";
pub const ENV_POSTGREST_KEY: &str = "TENANT_ANN_POSTGREST_KEY";

/// Errors that can occur when loading configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_version")]
    pub version: String,

    /// Vector length every indexed and query vector must have.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            dimension: DEFAULT_DIMENSION,
            store: StoreConfig::default(),
        }
    }
}

impl IndexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: IndexConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TENANT_ANN_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigLoadError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, then re-validate.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DIMENSION) {
            self.dimension = raw.trim().parse().map_err(|_| {
                ConfigLoadError::Validation(format!("{ENV_DIMENSION} is not an integer: {raw}"))
            })?;
        }
        let url = lookup(ENV_POSTGREST_URL);
        let key = lookup(ENV_POSTGREST_KEY);
        if url.is_some() || key.is_some() {
            let mut pg = match self.store {
                StoreConfig::Postgrest(pg) => pg,
                StoreConfig::InMemory => PostgrestConfig::default(),
            };
            if let Some(url) = url {
                pg.url = url;
            }
            if let Some(key) = key {
                pg.api_key = key;
            }
            self.store = StoreConfig::Postgrest(pg);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => {}
            v => return Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }
        if self.dimension == 0 {
            return Err(ConfigLoadError::Validation(
                "dimension must be >= 1".to_string(),
            ));
        }
        self.store.validate()
    }

    /// Build the configured store gateway.
    pub fn build_store(&self) -> Result<Arc<dyn EmbeddingStore>, IndexError> {
        self.store.build()
    }
}

/// Backing store selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Rows live in process; callers push them via [`InMemoryStore`].
    #[default]
    InMemory,
    /// PostgREST (e.g. Supabase) over HTTP. Requires the `postgrest` feature.
    Postgrest(PostgrestConfig),
}

impl StoreConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        match self {
            StoreConfig::InMemory => Ok(()),
            StoreConfig::Postgrest(pg) => pg.validate(),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn EmbeddingStore>, IndexError> {
        match self {
            StoreConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
            StoreConfig::Postgrest(pg) => {
                #[cfg(feature = "postgrest")]
                {
                    Ok(Arc::new(crate::store::PostgrestStore::new(pg.clone())?))
                }
                #[cfg(not(feature = "postgrest"))]
                {
                    let _ = pg;
                    Err(IndexError::Store(crate::error::StoreError::Unavailable(
                        "postgrest gateway disabled at compile time".into(),
                    )))
                }
            }
        }
    }
}

/// PostgREST table layout and client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgrestConfig {
    /// Project base URL; `/rest/v1/<table>` is appended.
    #[serde(default)]
    pub url: String,

    /// Sent as both `apikey` and bearer token.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_tenant_column")]
    pub tenant_column: String,

    #[serde(default = "default_item_column")]
    pub item_column: String,

    #[serde(default = "default_vector_column")]
    pub vector_column: String,

    #[serde(default = "default_updated_at_column")]
    pub updated_at_column: String,

    /// Rows per request; PostgREST deployments usually cap responses at 1000.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PostgrestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            table: default_table(),
            tenant_column: default_tenant_column(),
            item_column: default_item_column(),
            vector_column: default_vector_column(),
            updated_at_column: default_updated_at_column(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PostgrestConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.url.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "store.url must be set for the postgrest backend".to_string(),
            ));
        }
        if self.table.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "store.table must not be empty".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigLoadError::Validation(
                "store.page_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}
fn default_table() -> String {
    "intent_embedding".to_string()
}
fn default_tenant_column() -> String {
    "client_id".to_string()
}
fn default_item_column() -> String {
    "intent_id".to_string()
}
fn default_vector_column() -> String {
    "embedding".to_string()
}
fn default_updated_at_column() -> String {
    "updated_at".to_string()
}
fn default_page_size() -> usize {
    1000
}
fn default_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = IndexConfig::default();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.dimension, 1536);
        assert_eq!(config.store, StoreConfig::InMemory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_postgrest_yaml() {
        let yaml = r#"
version: "1.0"
dimension: 8
store:
  backend: postgrest
  url: "https://example.supabase.co"
  api_key: "secret"
  page_size: 250
"#;

        let config = IndexConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.dimension, 8);
        let StoreConfig::Postgrest(pg) = config.store else {
            panic!("expected postgrest store");
        };
        assert_eq!(pg.url, "https://example.supabase.co");
        assert_eq!(pg.table, "intent_embedding");
        assert_eq!(pg.tenant_column, "client_id");
        assert_eq!(pg.page_size, 250);
        assert_eq!(pg.timeout_secs, 10);
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
version: "1"
dimension: 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = IndexConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.dimension, 3);
        assert_eq!(config.store, StoreConfig::InMemory);
    }

    #[test]
    fn test_validation_failures() {
        let err = IndexConfig::from_yaml("dimension: 0").unwrap_err();
        assert!(err.to_string().contains("dimension must be >= 1"));

        let err = IndexConfig::from_yaml("version: \"2.0\"").unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedVersion(ref v) if v == "2.0"));

        let err = IndexConfig::from_yaml("store:\n  backend: postgrest\n").unwrap_err();
        assert!(err.to_string().contains("store.url"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DIMENSION, "384"),
            (ENV_POSTGREST_URL, "https://override.example"),
            (ENV_POSTGREST_KEY, "k"),
        ]);
        let config = IndexConfig::default()
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.dimension, 384);
        let StoreConfig::Postgrest(pg) = config.store else {
            panic!("expected postgrest store");
        };
        assert_eq!(pg.url, "https://override.example");
        assert_eq!(pg.api_key, "k");
    }

    #[test]
    fn test_bad_env_dimension() {
        let err = IndexConfig::default()
            .apply_env_from(|key| (key == ENV_DIMENSION).then(|| "wide".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DIMENSION));
    }

    #[test]
    fn test_in_memory_store_builds() {
        assert!(IndexConfig::default().build_store().is_ok());
    }
}
