
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::chunking::ChunkingConfig;
use crate::embeddings::VectorMetric;
use crate::rerank::{RerankStrategy, RerankerConfig};
use crate::scoring::{Aggregation, StrategyKind};

/// Upper bound on graph expansion radius accepted by search
pub const MAX_HOPS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Connection settings shared by every Ollama-backed collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Ollama,
    /// Offline feature-hashing embedder
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub metric: VectorMetric,
    pub batch_size: u32,
    /// Vector width of the hashing provider
    pub dimension: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            model: "nomic-embed-text:latest".to_string(),
            metric: VectorMetric::Cosine,
            batch_size: 16,
            dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub strategy: StrategyKind,
    pub hops: usize,
    pub limit: usize,
    /// Tables kept from the first scoring pass before graph expansion
    pub initial_top_k: usize,
    /// Tables handed to the reranker
    pub rerank_top_k: usize,
    pub aggregation: Aggregation,
    /// Weight of the first hybrid component; the second gets `1 - weight`
    pub hybrid_weight: f32,
    pub hybrid_components: [StrategyKind; 2],
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Hybrid,
            hops: 1,
            limit: 5,
            initial_top_k: 20,
            rerank_top_k: 10,
            aggregation: Aggregation::Max,
            hybrid_weight: 0.67,
            hybrid_components: [StrategyKind::Semantic, StrategyKind::Fuzzy],
            bm25_k1: 1.5,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 16 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid max tokens: {0} (must be between 16 and 8192)")]
    InvalidMaxTokens(usize),
    #[error("Overlap ({0}) must be less than half of max tokens ({1})")]
    InvalidOverlap(usize, usize),
    #[error("Invalid result limit: {0} (must be between 1 and 1000)")]
    InvalidLimit(usize),
    #[error("Invalid {0}: {1} (must be at least 1)")]
    InvalidTopK(&'static str, usize),
    #[error("Invalid hops: {0} (must be at most {max})", max = MAX_HOPS)]
    InvalidHops(usize),
    #[error("Invalid hybrid weight: {0} (must be between 0 and 1)")]
    InvalidHybridWeight(f32),
    #[error("Invalid hybrid components: {0}")]
    InvalidHybridComponents(String),
    #[error("Invalid BM25 parameter {0}: {1}")]
    InvalidBm25(&'static str, f32),
    #[error("Invalid reranker weights: {0} and {1} (must be non-negative and not both zero)")]
    InvalidRerankerWeights(f32, f32),
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Default configuration directory: `<config dir>/schema-search`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("schema-search"))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        self.ollama.validate()?;
        self.embedding.validate()?;
        self.validate_chunking_config()?;
        self.search.validate()?;
        self.validate_reranker_config()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(16..=8192).contains(&config.max_tokens) {
            return Err(ConfigError::InvalidMaxTokens(config.max_tokens));
        }

        if config.overlap_tokens * 2 >= config.max_tokens {
            return Err(ConfigError::InvalidOverlap(
                config.overlap_tokens,
                config.max_tokens,
            ));
        }

        if config.summarizer_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(config.summarizer_model.clone()));
        }

        if !(1..=600).contains(&config.summarizer_timeout_secs) {
            return Err(ConfigError::InvalidTimeout(config.summarizer_timeout_secs));
        }

        Ok(())
    }

    fn validate_reranker_config(&self) -> Result<(), ConfigError> {
        let config = &self.reranker;
        match config.strategy {
            RerankStrategy::None => Ok(()),
            RerankStrategy::Http => {
                if config.model.trim().is_empty() {
                    return Err(ConfigError::InvalidModel(config.model.clone()));
                }
                Url::parse(&config.url)
                    .map(|_| ())
                    .map_err(|_| ConfigError::InvalidUrl(config.url.clone()))
            }
            RerankStrategy::Bm25Blend => {
                let (score, bm25) = (config.score_weight, config.bm25_weight);
                if score < 0.0 || bm25 < 0.0 || score + bm25 <= 0.0 {
                    return Err(ConfigError::InvalidRerankerWeights(score, bm25));
                }
                Ok(())
            }
        }
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite index cache
    #[inline]
    pub fn cache_path(&self) -> PathBuf {
        self.get_base_dir().join("cache.db")
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.timeout_secs));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(16..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        Ok(())
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.limit) {
            return Err(ConfigError::InvalidLimit(self.limit));
        }

        if self.initial_top_k == 0 {
            return Err(ConfigError::InvalidTopK("initial_top_k", self.initial_top_k));
        }

        if self.rerank_top_k == 0 {
            return Err(ConfigError::InvalidTopK("rerank_top_k", self.rerank_top_k));
        }

        if self.hops > MAX_HOPS {
            return Err(ConfigError::InvalidHops(self.hops));
        }

        if !(0.0..=1.0).contains(&self.hybrid_weight) {
            return Err(ConfigError::InvalidHybridWeight(self.hybrid_weight));
        }

        let [first, second] = self.hybrid_components;
        if first == StrategyKind::Hybrid || second == StrategyKind::Hybrid {
            return Err(ConfigError::InvalidHybridComponents(
                "hybrid cannot be its own component".to_string(),
            ));
        }
        if first == second {
            return Err(ConfigError::InvalidHybridComponents(format!(
                "components must differ (both are {})",
                first
            )));
        }

        if self.bm25_k1.is_nan() || self.bm25_k1 < 0.0 {
            return Err(ConfigError::InvalidBm25("k1", self.bm25_k1));
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(ConfigError::InvalidBm25("b", self.bm25_b));
        }

        Ok(())
    }
}
