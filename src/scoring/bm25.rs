use std::collections::HashMap;

use super::{Aggregation, ScoringContext, ScoringStrategy, StrategyKind, lexical_tokens};

/// Share of the mean IDF given to terms whose IDF would be negative
pub const IDF_EPSILON: f32 = 0.25;

/// Okapi BM25 term statistics over a fixed document set.
///
/// Terms present in more than half of the documents would get a negative
/// IDF; they are floored at `IDF_EPSILON * mean IDF` instead so common terms
/// still contribute a little.
#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f32,
    idf: HashMap<String, f32>,
}

impl Bm25Index {
    #[inline]
    pub fn build<'d, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = &'d str>,
    {
        let mut term_freqs = Vec::new();
        let mut doc_lens = Vec::new();
        let mut doc_freqs: HashMap<String, u32> = HashMap::new();

        for document in documents {
            let tokens = lexical_tokens(document);
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens.iter() {
                *freqs.entry(token.clone()).or_default() += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_default() += 1;
            }
            doc_lens.push(tokens.len());
            term_freqs.push(freqs);
        }

        let doc_count = term_freqs.len() as f32;
        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f32 / doc_count
        };

        let mut idf: HashMap<String, f32> = doc_freqs
            .into_iter()
            .map(|(term, freq)| {
                let freq = freq as f32;
                (term, ((doc_count - freq + 0.5) / (freq + 0.5)).ln())
            })
            .collect();
        if !idf.is_empty() {
            let floor = IDF_EPSILON * idf.values().sum::<f32>() / idf.len() as f32;
            for value in idf.values_mut() {
                if *value < 0.0 {
                    *value = floor;
                }
            }
        }

        Self {
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.term_freqs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.term_freqs.is_empty()
    }

    #[inline]
    pub fn idf(&self, term: &str) -> Option<f32> {
        self.idf.get(term).copied()
    }

    /// BM25 score of document `doc` for already tokenized query terms
    #[inline]
    pub fn score(&self, query_tokens: &[String], doc: usize, k1: f32, b: f32) -> f32 {
        let Some(freqs) = self.term_freqs.get(doc) else {
            return 0.0;
        };
        let length_ratio = if self.avg_doc_len > 0.0 {
            self.doc_lens[doc] as f32 / self.avg_doc_len
        } else {
            0.0
        };
        let norm = k1 * (1.0 - b + b * length_ratio);

        query_tokens
            .iter()
            .filter_map(|term| {
                let tf = *freqs.get(term)? as f32;
                let idf = self.idf.get(term)?;
                Some(idf * tf * (k1 + 1.0) / (tf + norm))
            })
            .sum()
    }

    /// Scores of every document, in build order
    #[inline]
    pub fn scores(&self, query_tokens: &[String], k1: f32, b: f32) -> Vec<f32> {
        (0..self.len())
            .map(|doc| self.score(query_tokens, doc, k1, b))
            .collect()
    }
}

/// Lexical ranking of tables by BM25 over their chunks
#[derive(Debug, Clone)]
pub struct Bm25Strategy {
    k1: f32,
    b: f32,
    aggregation: Aggregation,
}

impl Bm25Strategy {
    #[inline]
    pub fn new(k1: f32, b: f32, aggregation: Aggregation) -> Self {
        Self { k1, b, aggregation }
    }
}

impl ScoringStrategy for Bm25Strategy {
    #[inline]
    fn kind(&self) -> StrategyKind {
        StrategyKind::Bm25
    }

    #[inline]
    fn score(&self, ctx: &ScoringContext<'_>, table: &str) -> f32 {
        self.aggregation
            .aggregate(
                ctx.corpus()
                    .chunks_of(table)
                    .iter()
                    .filter_map(|&chunk| self.chunk_score(ctx, chunk)),
            )
            .unwrap_or(0.0)
    }

    #[inline]
    fn chunk_score(&self, ctx: &ScoringContext<'_>, chunk: usize) -> Option<f32> {
        Some(ctx.corpus().bm25().score(ctx.tokens(), chunk, self.k1, self.b))
    }
}
