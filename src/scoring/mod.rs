
pub mod bm25;
pub mod fuzzy;
pub mod hybrid;
pub mod semantic;

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::chunking::Chunk;
use crate::config::SearchConfig;
use crate::embeddings::EmbeddingIndex;
use crate::embeddings::index::descending_then_id;
use crate::schema::Table;
use crate::text::{fold_plural, tokenize};
use crate::{Result, SchemaSearchError};

pub use bm25::{Bm25Index, Bm25Strategy};
pub use fuzzy::{FuzzyStrategy, indel_ratio};
pub use hybrid::HybridStrategy;
pub use semantic::SemanticStrategy;

/// Closed set of ranking strategies selectable per search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Semantic,
    Bm25,
    Fuzzy,
    Hybrid,
}

impl StrategyKind {
    pub const ALL: [Self; 4] = [Self::Semantic, Self::Bm25, Self::Fuzzy, Self::Hybrid];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Bm25 => "bm25",
            Self::Fuzzy => "fuzzy",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StrategyKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = SchemaSearchError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| SchemaSearchError::UnknownStrategy(s.to_string()))
    }
}

/// How chunk-level scores fold into one table score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Max,
    Mean,
}

impl Aggregation {
    /// `None` when there are no scores to fold
    #[inline]
    pub fn aggregate<I: IntoIterator<Item = f32>>(self, scores: I) -> Option<f32> {
        let mut count = 0_usize;
        let mut total = 0.0_f32;
        let mut best = f32::NEG_INFINITY;
        for score in scores {
            count += 1;
            total += score;
            best = best.max(score);
        }
        if count == 0 {
            return None;
        }
        match self {
            Self::Max => Some(best),
            Self::Mean => Some(total / count as f32),
        }
    }
}

/// Everything a strategy can score against: the indexed tables, their chunks,
/// the chunk vectors and the lexical statistics. Built once per index.
#[derive(Debug, Clone)]
pub struct ScoringCorpus {
    tables: BTreeMap<String, Table>,
    chunks: Vec<Chunk>,
    table_chunks: HashMap<String, Vec<usize>>,
    embeddings: EmbeddingIndex,
    bm25: Bm25Index,
}

impl ScoringCorpus {
    #[inline]
    pub fn new(tables: Vec<Table>, chunks: Vec<Chunk>, embeddings: EmbeddingIndex) -> Self {
        let mut table_chunks: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            table_chunks.entry(chunk.table.clone()).or_default().push(i);
        }
        for indices in table_chunks.values_mut() {
            indices.sort_by_key(|&i| chunks[i].position);
        }

        let bm25 = Bm25Index::build(chunks.iter().map(|c| c.text.as_str()));
        let tables = tables.into_iter().map(|t| (t.id(), t)).collect();

        Self {
            tables,
            chunks,
            table_chunks,
            embeddings,
            bm25,
        }
    }

    /// Indexed table identifiers in ascending order
    #[inline]
    pub fn table_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    #[inline]
    pub fn table(&self, id: &str) -> Option<&Table> {
        self.tables.get(id)
    }

    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Indices into [`Self::chunks`] for `table`, in position order
    #[inline]
    pub fn chunks_of(&self, table: &str) -> &[usize] {
        self.table_chunks.get(table).map_or(&[], Vec::as_slice)
    }

    #[inline]
    pub fn embeddings(&self) -> &EmbeddingIndex {
        &self.embeddings
    }

    #[inline]
    pub fn bm25(&self) -> &Bm25Index {
        &self.bm25
    }
}

/// Scores of one strategy over every indexed table, with their range
#[derive(Debug, Clone)]
pub struct CorpusScores {
    pub scores: HashMap<String, f32>,
    pub min: f32,
    pub max: f32,
}

impl CorpusScores {
    /// Min-max normalized score; a zero range normalizes to 0
    #[inline]
    pub fn normalized(&self, table: &str) -> f32 {
        let range = self.max - self.min;
        match self.scores.get(table) {
            Some(score) if range > 0.0 => (score - self.min) / range,
            _ => 0.0,
        }
    }
}

/// Per-query state shared by every strategy invocation of one search
pub struct ScoringContext<'a> {
    corpus: &'a ScoringCorpus,
    query: &'a str,
    tokens: Vec<String>,
    query_vector: Option<Vec<f32>>,
    memo: RefCell<HashMap<StrategyKind, Rc<CorpusScores>>>,
}

impl<'a> ScoringContext<'a> {
    #[inline]
    pub fn new(corpus: &'a ScoringCorpus, query: &'a str, query_vector: Option<Vec<f32>>) -> Self {
        Self {
            corpus,
            query,
            tokens: lexical_tokens(query),
            query_vector,
            memo: RefCell::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn corpus(&self) -> &'a ScoringCorpus {
        self.corpus
    }

    #[inline]
    pub fn query(&self) -> &str {
        self.query
    }

    /// Lowercased, plural-folded query terms
    #[inline]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    #[inline]
    pub fn query_vector(&self) -> Option<&[f32]> {
        self.query_vector.as_deref()
    }

    /// Score every indexed table with `strategy` once per query
    #[inline]
    pub fn corpus_scores(&self, strategy: &dyn ScoringStrategy) -> Rc<CorpusScores> {
        let cached = self.memo.borrow().get(&strategy.kind()).map(Rc::clone);
        if let Some(cached) = cached {
            return cached;
        }

        let scores: HashMap<String, f32> = self
            .corpus
            .table_ids()
            .map(|table| (table.to_string(), strategy.score(self, table)))
            .collect();
        let min = scores.values().copied().fold(f32::INFINITY, f32::min);
        let max = scores.values().copied().fold(f32::NEG_INFINITY, f32::max);
        let computed = Rc::new(CorpusScores {
            scores,
            min: if min.is_finite() { min } else { 0.0 },
            max: if max.is_finite() { max } else { 0.0 },
        });

        self.memo
            .borrow_mut()
            .insert(strategy.kind(), Rc::clone(&computed));
        computed
    }
}

/// A ranking function over indexed tables
pub trait ScoringStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Whether [`ScoringContext::query_vector`] must be populated
    #[inline]
    fn needs_query_embedding(&self) -> bool {
        false
    }

    /// Relevance of `table` to the context's query; larger is better
    fn score(&self, ctx: &ScoringContext<'_>, table: &str) -> f32;

    /// Relevance of one chunk, for strategies that work at chunk level
    #[inline]
    fn chunk_score(&self, _ctx: &ScoringContext<'_>, _chunk: usize) -> Option<f32> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTable {
    pub table: String,
    pub score: f32,
}

/// Score `tables` and sort them by score descending, then identifier
#[inline]
pub fn rank_tables<'t, I>(
    strategy: &dyn ScoringStrategy,
    ctx: &ScoringContext<'_>,
    tables: I,
) -> Vec<ScoredTable>
where
    I: IntoIterator<Item = &'t str>,
{
    let mut ranked: Vec<ScoredTable> = tables
        .into_iter()
        .map(|table| ScoredTable {
            table: table.to_string(),
            score: strategy.score(ctx, table),
        })
        .collect();
    ranked.sort_by(|a, b| descending_then_id(a.score, &a.table, b.score, &b.table));
    ranked
}

/// Build the strategy for `kind` from the search configuration
#[inline]
pub fn build_strategy(kind: StrategyKind, config: &SearchConfig) -> Result<Box<dyn ScoringStrategy>> {
    Ok(match kind {
        StrategyKind::Semantic => Box::new(SemanticStrategy::new(config.aggregation)),
        StrategyKind::Bm25 => Box::new(Bm25Strategy::new(
            config.bm25_k1,
            config.bm25_b,
            config.aggregation,
        )),
        StrategyKind::Fuzzy => Box::new(FuzzyStrategy),
        StrategyKind::Hybrid => {
            let [first, second] = config.hybrid_components;
            if first == StrategyKind::Hybrid || second == StrategyKind::Hybrid {
                return Err(SchemaSearchError::Config(
                    "hybrid cannot be its own component".to_string(),
                ));
            }
            Box::new(HybridStrategy::new(
                build_strategy(first, config)?,
                build_strategy(second, config)?,
                config.hybrid_weight,
            )?)
        }
    })
}

/// Tokens as compared by the lexical strategies
#[inline]
pub fn lexical_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .iter()
        .map(|token| fold_plural(token).to_string())
        .collect()
}
