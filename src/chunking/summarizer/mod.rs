#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::OllamaConfig;
use crate::schema::Table;

/// Turns a serialized table into natural-language text for the summarized strategy
pub trait TextSummarizer: Send + Sync {
    /// Model identifier, folded into the chunking strategy id
    fn id(&self) -> String;

    fn summarize(&self, table: &Table, serialized: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Summarizer backed by Ollama's `/api/generate` endpoint.
///
/// Calls are bounded by the agent's global timeout and are not retried; a
/// slow or failing model excludes the table instead of stalling indexing.
#[derive(Debug, Clone)]
pub struct OllamaSummarizer {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
}

impl OllamaSummarizer {
    #[inline]
    pub fn new(ollama: &OllamaConfig, model: &str, timeout: Duration) -> Result<Self> {
        let base_url = ollama
            .ollama_url()
            .context("Failed to generate Ollama URL from config")?;

        Ok(Self::with_base_url(base_url, model, timeout))
    }

    #[inline]
    pub fn with_base_url(base_url: Url, model: &str, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            base_url,
            model: model.to_string(),
            agent,
        }
    }

    fn prompt(serialized: &str) -> String {
        format!(
            "Describe the following database table for someone searching a schema. \
             State what the table stores, its important columns and how it relates \
             to other tables. Answer in a few plain sentences without markdown.\n\n{}",
            serialized
        )
    }
}

impl TextSummarizer for OllamaSummarizer {
    #[inline]
    fn id(&self) -> String {
        self.model.clone()
    }

    #[inline]
    fn summarize(&self, table: &Table, serialized: &str) -> Result<String> {
        let url = self
            .base_url
            .join("/api/generate")
            .context("Failed to build generate URL")?;

        let request = GenerateRequest {
            model: &self.model,
            prompt: Self::prompt(serialized),
            stream: false,
        };
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize generate request")?;

        debug!("Summarizing {} with {}", table.id(), self.model);
        let response_text = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .with_context(|| format!("Summary request for {} failed", table.id()))?;

        let response: GenerateResponse =
            serde_json::from_str(&response_text).context("Failed to parse generate response")?;

        Ok(response.response)
    }
}
