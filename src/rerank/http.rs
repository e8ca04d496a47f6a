use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RerankCandidate, Reranker, RerankerConfig, apply_scores};
use crate::{Result, SchemaSearchError};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    score: f32,
}

/// Cross-encoder served over HTTP (`POST /v1/rerank`)
#[derive(Debug, Clone)]
pub struct HttpReranker {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
}

impl HttpReranker {
    #[inline]
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| {
            SchemaSearchError::Config(format!("Invalid reranker URL {}: {}", config.url, e))
        })?;
        Ok(Self::with_base_url(base_url, &config.model))
    }

    #[inline]
    pub fn with_base_url(base_url: Url, model: &str) -> Self {
        Self {
            base_url,
            model: model.to_string(),
            agent: agent(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = agent(timeout);
        self
    }

    fn request_scores(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> anyhow::Result<Vec<(usize, f32)>> {
        let url = self
            .base_url
            .join("/v1/rerank")
            .context("Failed to build rerank URL")?;
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: candidates.iter().map(|c| c.document.as_str()).collect(),
        };
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize rerank request")?;

        let response_text = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .context("Rerank request failed")?;

        let response: RerankResponse =
            serde_json::from_str(&response_text).context("Failed to parse rerank response")?;
        Ok(response
            .results
            .into_iter()
            .map(|item| (item.index, item.score))
            .collect())
    }
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

impl Reranker for HttpReranker {
    #[inline]
    fn model_id(&self) -> String {
        format!("http:{}", self.model)
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

        debug!(
            "Reranking {} candidates with {} at {}",
            candidates.len(),
            self.model,
            self.base_url
        );
        let scores = self
            .request_scores(query, &candidates)
            .map_err(|e| SchemaSearchError::Rerank(format!("{:#}", e)))?;
        apply_scores(candidates, &scores)
    }
}
