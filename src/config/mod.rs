//! Configuration loading for vaultgraph.

use std::path::PathBuf;

use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "VAULTGRAPH_CONFIG";

/// Errors that can occur when loading or validating config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where chunks are persisted and their embedding size.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

/// Which embedding provider to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Local feature hashing; no network.
    #[default]
    Hashing,
    /// OpenAI-compatible HTTP endpoint.
    Http,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_embeddings_path")]
    pub path: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

/// Tuning for the search pipeline and its enrichment steps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_limit: usize,
    /// Default similarity cutoff applied when a request sets none.
    pub min_similarity: Option<f32>,
    pub related_limit: usize,
    pub related_min_similarity: f32,
    pub neighbor_limit: usize,
    pub top_tag_limit: usize,
    pub highlight_limit: usize,
    pub concept_limit: usize,
    pub concept_min_confidence: f32,
}

/// Tuning for entity extraction and disambiguation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Maximum gap in bytes between two mentions considered for a relationship.
    pub window: usize,
    /// Cosine similarity needed to merge a mention into an entity by embedding.
    pub similarity_threshold: f32,
    pub min_relationship_confidence: f32,
    /// Entities below this confidence are kept but reported as low-confidence.
    pub low_confidence: f32,
    pub timeout_ms: u64,
}

/// Logging settings; `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_store_path() -> String {
    ProjectDirs::from("", "", "vaultgraph").map_or_else(
        || "./.vaultgraph".to_string(),
        |dirs| dirs.data_dir().to_string_lossy().to_string(),
    )
}

fn default_dimension() -> usize {
    256
}

fn default_api_base() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}

fn default_embeddings_path() -> String {
    "/embeddings".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            dimension: default_dimension(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            api_base: default_api_base(),
            path: default_embeddings_path(),
            model: default_model(),
            api_key_env: None,
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 10,
            min_similarity: None,
            related_limit: 5,
            related_min_similarity: 0.5,
            neighbor_limit: 5,
            top_tag_limit: 3,
            highlight_limit: 3,
            concept_limit: 10,
            concept_min_confidence: 0.6,
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            window: 80,
            similarity_threshold: 0.85,
            min_relationship_confidence: 0.35,
            low_confidence: 0.5,
            timeout_ms: 2_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from `$VAULTGRAPH_CONFIG` or ~/.config/vaultgraph/config.toml,
    /// or return defaults when neither exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV)
            && !path.is_empty()
        {
            return Some(PathBuf::from(path));
        }

        ProjectDirs::from("", "", "vaultgraph").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.dimension == 0 {
            return Err(ConfigError::Invalid("store.dimension must be > 0".into()));
        }
        if self.search.default_limit == 0 {
            return Err(ConfigError::Invalid("search.default_limit must be > 0".into()));
        }
        if let Some(min) = self.search.min_similarity
            && !(-1.0..=1.0).contains(&min)
        {
            return Err(ConfigError::Invalid(
                "search.min_similarity must be within [-1, 1]".into(),
            ));
        }

        let unit = [
            ("search.related_min_similarity", self.search.related_min_similarity),
            ("search.concept_min_confidence", self.search.concept_min_confidence),
            ("extraction.similarity_threshold", self.extraction.similarity_threshold),
            (
                "extraction.min_relationship_confidence",
                self.extraction.min_relationship_confidence,
            ),
            ("extraction.low_confidence", self.extraction.low_confidence),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{key} must be within [0, 1]")));
            }
        }

        if self.extraction.timeout_ms == 0 {
            return Err(ConfigError::Invalid("extraction.timeout_ms must be > 0".into()));
        }
        if self.embedding.provider == EmbeddingProvider::Http && self.embedding.api_base.is_empty()
        {
            return Err(ConfigError::Invalid(
                "embedding.api_base is required for the http provider".into(),
            ));
        }
        crate::logging::validate_filter(&self.logging.level)
            .map_err(|e| ConfigError::Invalid(format!("logging.level: {e}")))?;

        Ok(())
    }

    /// Resolved store directory.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        expand_tilde(&self.store.path)
    }
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(base_dirs) = BaseDirs::new()
    {
        return base_dirs.home_dir().join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            "[store]\npath = \"/tmp/vg\"\n\n[search]\nrelated_limit = 2\n",
        )
        .unwrap();

        assert_eq!(config.store.path, "/tmp/vg");
        assert_eq!(config.store.dimension, 256);
        assert_eq!(config.search.related_limit, 2);
        assert_eq!(config.search.default_limit, 10);
        assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_dimension_is_invalid() {
        let config: Config = toml::from_str("[store]\ndimension = 0\n").unwrap();

        let err = config.validate().unwrap_err();

        assert!(err.to_string().contains("store.dimension"));
    }

    #[test]
    fn thresholds_outside_unit_range_are_invalid() {
        let config: Config =
            toml::from_str("[extraction]\nsimilarity_threshold = 1.5\n").unwrap();

        let err = config.validate().unwrap_err();

        assert!(err.to_string().contains("extraction.similarity_threshold"));
    }

    #[test]
    fn unknown_log_levels_are_invalid() {
        let config: Config = toml::from_str("[logging]\nlevel = \"loud\"\n").unwrap();
        let directive: Config =
            toml::from_str("[logging]\nlevel = \"warn,vaultgraph=debug\"\n").unwrap();

        let err = config.validate().unwrap_err();

        assert!(err.to_string().contains("logging.level"));
        assert!(directive.validate().is_ok());
    }

    #[test]
    fn http_provider_parses() {
        let config: Config = toml::from_str(
            "[embedding]\nprovider = \"http\"\napi_base = \"https://api.example.com/v1\"\napi_key_env = \"EMBED_KEY\"\n",
        )
        .unwrap();

        assert_eq!(config.embedding.provider, EmbeddingProvider::Http);
        assert_eq!(config.embedding.api_key_env.as_deref(), Some("EMBED_KEY"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/var/data"), PathBuf::from("/var/data"));
    }
}
