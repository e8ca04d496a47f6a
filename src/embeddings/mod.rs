
pub mod hashing;
pub mod index;
pub mod ollama;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, EmbeddingProvider};

pub use hashing::HashingEmbedder;
pub use index::{EmbeddingBuildStats, EmbeddingIndex, EmbeddingStore};
pub use ollama::OllamaEmbedder;

/// Embedding model abstraction
pub trait Embedder: Send + Sync {
    /// Identifier of the model; vectors from different ids are never mixed
    fn model_id(&self) -> String;

    /// Embed several texts, returning one vector per input in order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    #[inline]
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .context("Embedder returned no vector for the query")
    }
}

/// Similarity function applied between query and chunk vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMetric {
    Cosine,
    Dot,
    /// Reported as `1 / (1 + distance)` so larger is always better
    Euclidean,
}

impl VectorMetric {
    #[inline]
    pub fn similarity(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let norm_a = norm(a);
                let norm_b = norm(b);
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot(a, b) / (norm_a * norm_b)
                }
            }
            Self::Dot => dot(a, b),
            Self::Euclidean => {
                let distance = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

impl fmt::Display for VectorMetric {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::Dot => f.write_str("dot"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for VectorMetric {
    type Err = String;

    #[inline]
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" => Ok(Self::Dot),
            "euclidean" => Ok(Self::Euclidean),
            other => Err(format!("unknown vector metric {}", other)),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Build the embedder selected by configuration
#[inline]
pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Ollama => {
            let client = OllamaEmbedder::new(config)
                .context("Failed to create Ollama embedder")?
                .with_timeout(Duration::from_secs(config.ollama.timeout_secs));
            Ok(Arc::new(client))
        }
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(
            config.embedding.dimension as usize,
        ))),
    }
}
