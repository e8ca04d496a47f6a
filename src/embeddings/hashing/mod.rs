use anyhow::Result;

use super::Embedder;
use crate::text::{fold_plural, stable_hash, tokenize};

const TRIGRAM_WEIGHT: f32 = 0.3;

/// Deterministic bag-of-features embedder that needs no model server.
///
/// Word tokens (plural-folded) and their boundary-marked character trigrams
/// are hashed into a fixed number of signed buckets and L2-normalized, so
/// texts sharing vocabulary or spelling fragments land close together.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];

        for token in tokenize(text) {
            let word = fold_plural(&token);
            self.accumulate(&mut vector, "w", word, 1.0);

            let marked: Vec<char> = format!("<{}>", word).chars().collect();
            for trigram in marked.windows(3) {
                let trigram: String = trigram.iter().collect();
                self.accumulate(&mut vector, "c", &trigram, TRIGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], kind: &str, feature: &str, weight: f32) {
        let hash = stable_hash(format!("{}:{}", kind, feature).as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    #[inline]
    fn model_id(&self) -> String {
        format!("hashing-v1:{}", self.dimension)
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}
