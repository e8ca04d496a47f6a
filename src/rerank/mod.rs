
mod http;

pub use http::HttpReranker;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::scoring::{Bm25Index, lexical_tokens};
use crate::{Result, SchemaSearchError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategy {
    /// Pass candidates through unchanged
    #[default]
    None,
    /// Cross-encoder behind an HTTP `/v1/rerank` endpoint
    Http,
    /// Blend of the incoming score with BM25 over the candidate documents
    Bm25Blend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankerConfig {
    pub strategy: RerankStrategy,
    pub model: String,
    /// Base URL of the rerank service
    pub url: String,
    pub score_weight: f32,
    pub bm25_weight: f32,
}

impl Default for RerankerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            strategy: RerankStrategy::None,
            model: "BAAI/bge-reranker-base".to_string(),
            url: "http://localhost:8080".to_string(),
            score_weight: 0.7,
            bm25_weight: 0.3,
        }
    }
}

/// One table handed to the reranker
#[derive(Debug, Clone, PartialEq)]
pub struct RerankCandidate {
    pub table: String,
    pub score: f32,
    /// Text the reranking model judges against the query
    pub document: String,
}

/// Reorders candidates by relevance. Implementations return exactly the
/// candidates they were given; only order and scores change.
pub trait Reranker: Send + Sync {
    fn model_id(&self) -> String;

    fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
    ) -> Result<Vec<RerankCandidate>>;

    /// How many reranked candidates to keep given the configured
    /// `rerank_top_k`; `None` keeps them all
    #[inline]
    fn top_k(&self, configured: usize) -> Option<usize> {
        Some(configured)
    }
}

/// Used when no reranking model is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityReranker;

impl Reranker for IdentityReranker {
    #[inline]
    fn model_id(&self) -> String {
        "identity".to_string()
    }

    #[inline]
    fn rerank(
        &self,
        _query: &str,
        candidates: Vec<RerankCandidate>,
    ) -> Result<Vec<RerankCandidate>> {
        Ok(candidates)
    }

    #[inline]
    fn top_k(&self, _configured: usize) -> Option<usize> {
        None
    }
}

/// Listwise blend of the first-stage score and BM25 over the candidates.
///
/// Incoming scores are min-max normalized, BM25 scores are divided by their
/// maximum; ties keep the incoming order.
#[derive(Debug, Clone)]
pub struct Bm25BlendReranker {
    score_weight: f32,
    bm25_weight: f32,
    k1: f32,
    b: f32,
}

impl Bm25BlendReranker {
    #[inline]
    pub fn new(score_weight: f32, bm25_weight: f32) -> Self {
        Self {
            score_weight,
            bm25_weight,
            k1: 1.5,
            b: 0.75,
        }
    }
}

impl Reranker for Bm25BlendReranker {
    #[inline]
    fn model_id(&self) -> String {
        format!("bm25-blend:{}:{}", self.score_weight, self.bm25_weight)
    }

    #[inline]
    fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
    ) -> Result<Vec<RerankCandidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let index = Bm25Index::build(candidates.iter().map(|c| c.document.as_str()));
        let bm25 = index.scores(&lexical_tokens(query), self.k1, self.b);
        let bm25_max = bm25.iter().copied().fold(0.0_f32, f32::max);

        let min = candidates
            .iter()
            .map(|c| c.score)
            .fold(f32::INFINITY, f32::min);
        let max = candidates
            .iter()
            .map(|c| c.score)
            .fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;

        let mut blended: Vec<RerankCandidate> = candidates
            .into_iter()
            .zip(bm25)
            .map(|(mut candidate, lexical)| {
                let score = if range > 0.0 {
                    (candidate.score - min) / range
                } else {
                    0.0
                };
                let lexical = if bm25_max > 0.0 {
                    lexical / bm25_max
                } else {
                    0.0
                };
                candidate.score = self.score_weight * score + self.bm25_weight * lexical;
                candidate
            })
            .collect();
        blended.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(blended)
    }
}

/// Build the reranker selected by configuration
#[inline]
pub fn create_reranker(config: &Config) -> Result<Arc<dyn Reranker>> {
    let reranker: Arc<dyn Reranker> = match config.reranker.strategy {
        RerankStrategy::None => Arc::new(IdentityReranker),
        RerankStrategy::Http => Arc::new(HttpReranker::new(&config.reranker)?),
        RerankStrategy::Bm25Blend => Arc::new(Bm25BlendReranker::new(
            config.reranker.score_weight,
            config.reranker.bm25_weight,
        )),
    };
    debug!("Using reranker {}", reranker.model_id());
    Ok(reranker)
}

/// Reorder `candidates` to follow `scores` (`(index, score)` pairs from a
/// model). Candidates the model did not score keep their relative order
/// after the scored ones.
pub(crate) fn apply_scores(
    candidates: Vec<RerankCandidate>,
    scores: &[(usize, f32)],
) -> Result<Vec<RerankCandidate>> {
    let count = candidates.len();
    let mut slots: Vec<Option<RerankCandidate>> = candidates.into_iter().map(Some).collect();

    let mut scored = Vec::with_capacity(scores.len());
    for &(index, score) in scores {
        let slot = slots.get_mut(index).ok_or_else(|| {
            SchemaSearchError::Rerank(format!(
                "model returned index {} for {} candidates",
                index, count
            ))
        })?;
        if let Some(mut candidate) = slot.take() {
            candidate.score = score;
            scored.push(candidate);
        }
    }
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.extend(slots.into_iter().flatten());
    Ok(scored)
}
