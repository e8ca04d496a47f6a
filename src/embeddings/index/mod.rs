#[cfg(test)]
mod tests;

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::{Embedder, VectorMetric};
use crate::chunking::Chunk;
use crate::{Result, SchemaSearchError};

/// Chunk vectors plus the metadata they are only valid under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStore {
    pub model_id: String,
    pub metric: VectorMetric,
    pub dimension: usize,
    pub vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingStore {
    /// True when records can be reused for `model_id` under `metric`
    #[inline]
    pub fn is_compatible(&self, model_id: &str, metric: VectorMetric) -> bool {
        self.model_id == model_id && self.metric == metric
    }

    /// Every vector must have the store's dimension
    #[inline]
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self
            .vectors
            .iter()
            .find(|(_, vector)| vector.len() != self.dimension)
        {
            Some((chunk_id, vector)) => Err(format!(
                "vector for chunk {} has dimension {} but the store expects {}",
                chunk_id,
                vector.len(),
                self.dimension
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingBuildStats {
    pub computed: usize,
    pub reused: usize,
}

/// Immutable vector index over the chunks of one build
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    store: EmbeddingStore,
}

impl EmbeddingIndex {
    /// Embed `chunks`, reusing vectors from `previous` whose chunk id matches.
    /// A previous store built with another model or metric is ignored entirely.
    #[inline]
    pub fn build(
        chunks: &[Chunk],
        embedder: &dyn Embedder,
        metric: VectorMetric,
        batch_size: usize,
        previous: Option<&EmbeddingStore>,
        progress: &ProgressBar,
    ) -> Result<(Self, EmbeddingBuildStats)> {
        let model_id = embedder.model_id();
        let previous = previous.filter(|store| {
            let compatible = store.is_compatible(&model_id, metric);
            if !compatible {
                info!(
                    "Discarding cached embeddings from {} ({}); now using {} ({})",
                    store.model_id, store.metric, model_id, metric
                );
            }
            compatible
        });

        let mut vectors: HashMap<String, Vec<f32>> = HashMap::with_capacity(chunks.len());
        let mut missing: Vec<&Chunk> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(chunks.len());
        for chunk in chunks {
            if !seen.insert(chunk.id.as_str()) {
                continue;
            }
            match previous.and_then(|store| store.vectors.get(&chunk.id)) {
                Some(vector) => {
                    vectors.insert(chunk.id.clone(), vector.clone());
                }
                None => missing.push(chunk),
            }
        }
        let stats = EmbeddingBuildStats {
            computed: missing.len(),
            reused: vectors.len(),
        };
        progress.set_length(missing.len() as u64);

        let batches: Vec<Vec<Vec<f32>>> = missing
            .par_chunks(batch_size.max(1))
            .map(|batch| {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                let embedded = embedder.embed_batch(&texts).map_err(|e| {
                    SchemaSearchError::Embedding(format!("{} failed: {:#}", model_id, e))
                })?;
                if embedded.len() != texts.len() {
                    return Err(SchemaSearchError::Embedding(format!(
                        "{} returned {} vectors for {} texts",
                        model_id,
                        embedded.len(),
                        texts.len()
                    )));
                }
                progress.inc(texts.len() as u64);
                Ok(embedded)
            })
            .collect::<Result<_>>()?;
        progress.finish_and_clear();

        for (chunk, vector) in missing.iter().zip(batches.into_iter().flatten()) {
            vectors.insert(chunk.id.clone(), vector);
        }

        let dimension = vectors
            .values()
            .next()
            .map(Vec::len)
            .or_else(|| previous.map(|store| store.dimension))
            .unwrap_or(0);
        let store = EmbeddingStore {
            model_id,
            metric,
            dimension,
            vectors,
        };
        store.validate().map_err(SchemaSearchError::Embedding)?;

        debug!(
            "Embedding index ready: {} vectors of dimension {} ({} computed, {} reused)",
            store.vectors.len(),
            store.dimension,
            stats.computed,
            stats.reused
        );
        Ok((Self { store }, stats))
    }

    /// Wrap a store restored from the cache
    #[inline]
    pub fn from_store(store: EmbeddingStore) -> std::result::Result<Self, String> {
        store.validate()?;
        Ok(Self { store })
    }

    #[inline]
    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.store.vectors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.store.vectors.is_empty()
    }

    #[inline]
    pub fn vector(&self, chunk_id: &str) -> Option<&[f32]> {
        self.store.vectors.get(chunk_id).map(Vec::as_slice)
    }

    /// Similarity between a query vector and one chunk under the store's metric
    #[inline]
    pub fn similarity(&self, query: &[f32], chunk_id: &str) -> Option<f32> {
        self.vector(chunk_id)
            .map(|vector| self.store.metric.similarity(query, vector))
    }

    /// Embed a query with the model the index was built with
    #[inline]
    pub fn embed_query(&self, embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
        let model_id = embedder.model_id();
        if model_id != self.store.model_id {
            return Err(SchemaSearchError::Embedding(format!(
                "query embedder {} does not match index model {}",
                model_id, self.store.model_id
            )));
        }

        let vector = embedder
            .embed_query(text)
            .map_err(|e| SchemaSearchError::Embedding(format!("{:#}", e)))?;
        if !self.is_empty() && vector.len() != self.store.dimension {
            return Err(SchemaSearchError::Embedding(format!(
                "query vector has dimension {} but the index expects {}",
                vector.len(),
                self.store.dimension
            )));
        }
        Ok(vector)
    }

    /// Top `top_k` chunk ids by similarity to `text`, ties broken by chunk id
    #[inline]
    pub fn query(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let query = self.embed_query(embedder, text)?;
        let mut scored: Vec<(String, f32)> = self
            .store
            .vectors
            .iter()
            .map(|(id, vector)| (id.clone(), self.store.metric.similarity(&query, vector)))
            .collect();
        scored.sort_by(|a, b| descending_then_id(a.1, &a.0, b.1, &b.0));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Order by score descending, then identifier ascending
#[inline]
pub fn descending_then_id(score_a: f32, id_a: &str, score_b: f32, id_b: &str) -> Ordering {
    score_b.total_cmp(&score_a).then_with(|| id_a.cmp(id_b))
}
