
use anyhow::Context;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheMeta, CacheSnapshot, CacheStore, Fingerprint};
use crate::chunking::{Chunk, Chunker, ChunkingStrategy, OllamaSummarizer, TextSummarizer};
use crate::config::{Config, MAX_HOPS};
use crate::embeddings::{EmbeddingIndex, EmbeddingStore, Embedder, create_embedder};
use crate::graph::SchemaGraph;
use crate::rerank::{RerankCandidate, Reranker, create_reranker};
use crate::schema::{SchemaExtractor, Table};
use crate::scoring::{ScoredTable, ScoringContext, ScoringCorpus, ScoringStrategy, StrategyKind};
use crate::scoring::{build_strategy, rank_tables};
use crate::{Result, SchemaSearchError};

/// Lifecycle of the engine as reported by [`SchemaSearch::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    NotIndexed,
    Indexing,
    Ready,
    /// The last build failed; a previously ready snapshot keeps serving
    Failed(String),
}

impl fmt::Display for IndexStatus {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotIndexed => f.write_str("not indexed"),
            Self::Indexing => f.write_str("indexing"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexMode {
    /// Reuse cached embeddings for unchanged chunks
    #[default]
    Incremental,
    /// Recompute every embedding and summary; the cache is replaced only
    /// once the rebuild succeeds
    Force,
}

/// Statistics about one `index()` run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub table_count: usize,
    pub chunk_count: usize,
    pub embeddings_computed: usize,
    pub embeddings_reused: usize,
    /// Tables excluded because they could not be chunked
    pub failed_tables: Vec<String>,
    pub elapsed: Duration,
}

/// One search query. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub hops: Option<usize>,
    pub limit: Option<usize>,
    pub strategy: Option<String>,
}

impl SearchRequest {
    #[inline]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            hops: None,
            limit: None,
            strategy: None,
        }
    }

    #[inline]
    pub fn hops(mut self, hops: usize) -> Self {
        self.hops = Some(hops);
        self
    }

    #[inline]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[inline]
    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub table: String,
    /// Strategy-specific scale; only comparable within one search
    pub score: f32,
    pub schema: Table,
    /// Foreign-key neighbors within the requested hops, sorted
    pub related_tables: Vec<String>,
    /// Chunk texts of the table, best match first
    pub matched_chunks: Vec<String>,
}

/// Results plus the candidate sets each stage produced
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Tables kept from the first scoring pass, best first
    pub initial_candidates: Vec<String>,
    /// Initial candidates plus their graph neighborhood, sorted
    pub expanded_candidates: Vec<String>,
    pub elapsed: Duration,
}

/// An immutable, fully built index. Searches share it through an `Arc`.
#[derive(Debug)]
pub struct IndexSnapshot {
    corpus: ScoringCorpus,
    graph: SchemaGraph,
    fingerprint: Fingerprint,
    meta: CacheMeta,
}

impl IndexSnapshot {
    #[inline]
    pub fn corpus(&self) -> &ScoringCorpus {
        &self.corpus
    }

    #[inline]
    pub fn graph(&self) -> &SchemaGraph {
        &self.graph
    }

    #[inline]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    #[inline]
    pub fn meta(&self) -> &CacheMeta {
        &self.meta
    }

    fn from_cache(fingerprint: Fingerprint, snapshot: CacheSnapshot) -> Result<Self> {
        let embeddings = EmbeddingIndex::from_store(snapshot.embeddings)
            .map_err(SchemaSearchError::CacheCorruption)?;
        let graph = SchemaGraph::from_snapshot(&snapshot.graph)
            .map_err(SchemaSearchError::CacheCorruption)?;
        Ok(Self {
            corpus: ScoringCorpus::new(snapshot.tables, snapshot.chunks, embeddings),
            graph,
            fingerprint,
            meta: snapshot.meta,
        })
    }
}

struct BuildOutput {
    tables: Vec<Table>,
    chunks: Vec<Chunk>,
    embeddings: EmbeddingIndex,
    summaries: HashMap<String, String>,
    failed_tables: Vec<String>,
    strategy_id: String,
    computed: usize,
    reused: usize,
}

struct ScoringPass {
    initial: Vec<String>,
    expanded: Vec<ScoredTable>,
    matched: HashMap<String, Vec<String>>,
}

/// Schema search engine: builds the index from an extractor and answers
/// queries against the most recent successful build.
pub struct SchemaSearch {
    config: Config,
    extractor: Arc<dyn SchemaExtractor>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    summarizer: Option<Arc<dyn TextSummarizer>>,
    cache: CacheStore,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    status: RwLock<IndexStatus>,
    build_lock: Mutex<()>,
}

impl SchemaSearch {
    /// Assemble an engine from explicit collaborators. The summarizer for the
    /// summarized chunking strategy is created from configuration; use
    /// [`Self::with_summarizer`] to supply another one.
    #[inline]
    pub fn new(
        config: Config,
        extractor: Arc<dyn SchemaExtractor>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        cache: CacheStore,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchemaSearchError::Config(e.to_string()))?;

        let summarizer: Option<Arc<dyn TextSummarizer>> =
            if config.chunking.strategy == ChunkingStrategy::Summarized {
                let summarizer = OllamaSummarizer::new(
                    &config.ollama,
                    &config.chunking.summarizer_model,
                    Duration::from_secs(config.chunking.summarizer_timeout_secs),
                )
                .map_err(|e| SchemaSearchError::Config(format!("{:#}", e)))?;
                Some(Arc::new(summarizer))
            } else {
                None
            };

        Ok(Self {
            config,
            extractor,
            embedder,
            reranker,
            summarizer,
            cache,
            snapshot: RwLock::new(None),
            status: RwLock::new(IndexStatus::NotIndexed),
            build_lock: Mutex::new(()),
        })
    }

    /// Assemble an engine with the embedder, reranker and cache selected by
    /// configuration
    #[inline]
    pub async fn from_config(config: Config, extractor: Arc<dyn SchemaExtractor>) -> Result<Self> {
        let embedder = create_embedder(&config)
            .map_err(|e| SchemaSearchError::Config(format!("{:#}", e)))?;
        let reranker = create_reranker(&config)?;
        let cache = CacheStore::open(config.cache_path()).await?;
        Self::new(config, extractor, embedder, reranker, cache)
    }

    #[inline]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn TextSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    #[inline]
    pub fn status(&self) -> IndexStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The snapshot searches currently run against
    #[inline]
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    fn set_status(&self, status: IndexStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn swap_snapshot(&self, snapshot: Option<Arc<IndexSnapshot>>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn chunker(&self) -> Chunker {
        let chunker = Chunker::new(self.config.chunking.clone());
        match &self.summarizer {
            Some(summarizer) => chunker.with_summarizer(Arc::clone(summarizer)),
            None => chunker,
        }
    }

    fn progress_bar(&self, message: &'static str) -> ProgressBar {
        if self.config.chunking.show_progress {
            let bar = ProgressBar::new(0);
            bar.set_style(ProgressStyle::default_bar());
            bar.set_message(message);
            bar
        } else {
            ProgressBar::hidden()
        }
    }

    /// Extract, chunk, embed and persist the schema, then make the new index
    /// the one searches use. On failure nothing is written and the previous
    /// index keeps serving.
    #[inline]
    pub async fn index(&self, mode: IndexMode) -> Result<IndexStats> {
        let _guard = self.build_lock.lock().await;
        let started = Instant::now();
        self.set_status(IndexStatus::Indexing);
        info!("Indexing {} ({:?})", self.extractor.identity(), mode);

        match self.build(mode, started).await {
            Ok(stats) => {
                self.set_status(IndexStatus::Ready);
                info!(
                    "Indexed {} tables into {} chunks in {:.2?} ({} embeddings computed, {} reused, {} tables failed)",
                    stats.table_count,
                    stats.chunk_count,
                    stats.elapsed,
                    stats.embeddings_computed,
                    stats.embeddings_reused,
                    stats.failed_tables.len()
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Indexing failed: {}", e);
                self.set_status(IndexStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn build(&self, mode: IndexMode, started: Instant) -> Result<IndexStats> {
        let identity = self.extractor.identity();
        let tables = self
            .extractor
            .extract()
            .await
            .map_err(|e| SchemaSearchError::Extraction(format!("{:#}", e)))?;
        let tables = dedup_tables(tables);
        if tables.is_empty() {
            return Err(SchemaSearchError::Extraction(format!(
                "{} has no tables",
                identity
            )));
        }
        debug!("Extracted {} tables from {}", tables.len(), identity);

        // Force rebuilds from scratch; the cache itself is only replaced by
        // the final persist
        let (previous, summary_cache) = match mode {
            IndexMode::Force => (None, HashMap::new()),
            IndexMode::Incremental => self.load_reusable().await,
        };

        let chunker = self.chunker().with_summary_cache(summary_cache);
        let embedder = Arc::clone(&self.embedder);
        let metric = self.config.embedding.metric;
        let batch_size = self.config.embedding.batch_size as usize;
        let progress = self.progress_bar("embedding");

        let output = tokio::task::spawn_blocking(move || -> Result<BuildOutput> {
            let outcome = chunker.chunk_tables(&tables)?;
            let failed_tables: Vec<String> =
                outcome.failures.iter().map(|f| f.table.clone()).collect();
            let failed: HashSet<&str> = failed_tables.iter().map(String::as_str).collect();
            let tables: Vec<Table> = tables
                .into_iter()
                .filter(|table| !failed.contains(table.id().as_str()))
                .collect();
            if tables.is_empty() {
                let failure = outcome.failures.first();
                return Err(SchemaSearchError::Chunking {
                    table: failure.map(|f| f.table.clone()).unwrap_or_default(),
                    message: "no table could be chunked".to_string(),
                });
            }

            let (embeddings, stats) = EmbeddingIndex::build(
                &outcome.chunks,
                embedder.as_ref(),
                metric,
                batch_size,
                previous.as_ref(),
                &progress,
            )?;

            Ok(BuildOutput {
                tables,
                chunks: outcome.chunks,
                embeddings,
                summaries: outcome.summaries,
                failed_tables,
                strategy_id: chunker.strategy_id(),
                computed: stats.computed,
                reused: stats.reused,
            })
        })
        .await
        .context("Index build task failed")??;

        let graph = SchemaGraph::build(&output.tables);
        debug!(
            "Foreign key graph has {} nodes and {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        let store = output.embeddings.store();
        let fingerprint =
            Fingerprint::compute(&identity, &store.model_id, metric, &output.strategy_id);
        let meta = CacheMeta {
            fingerprint: fingerprint.as_str().to_string(),
            database: identity,
            embedding_model: store.model_id.clone(),
            metric,
            dimension: store.dimension,
            chunking_strategy: output.strategy_id,
            table_count: output.tables.len(),
            chunk_count: output.chunks.len(),
            built_at: Utc::now(),
        };
        let cached = CacheSnapshot {
            meta,
            tables: output.tables,
            chunks: output.chunks,
            embeddings: store.clone(),
            graph: graph.to_snapshot(),
            summaries: output.summaries,
        };
        self.cache.persist(&cached).await?;

        let CacheSnapshot {
            meta,
            tables,
            chunks,
            ..
        } = cached;
        let stats = IndexStats {
            table_count: tables.len(),
            chunk_count: chunks.len(),
            embeddings_computed: output.computed,
            embeddings_reused: output.reused,
            failed_tables: output.failed_tables,
            elapsed: started.elapsed(),
        };
        let snapshot = IndexSnapshot {
            corpus: ScoringCorpus::new(tables, chunks, output.embeddings),
            graph,
            fingerprint,
            meta,
        };
        self.swap_snapshot(Some(Arc::new(snapshot)));

        Ok(stats)
    }

    /// Embeddings and summaries from the cache that a rebuild may reuse
    async fn load_reusable(&self) -> (Option<EmbeddingStore>, HashMap<String, String>) {
        let previous = match self.cache.load_embeddings().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Ignoring cached embeddings: {}", e);
                None
            }
        };
        let summaries = match self.cache.load_summaries().await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!("Ignoring cached summaries: {}", e);
                HashMap::new()
            }
        };
        (previous, summaries)
    }

    /// Serve the cached index without extracting the schema again.
    ///
    /// Returns `false` when the cache is empty, was built under different
    /// settings, or was corrupt (in which case it is cleared).
    #[inline]
    pub async fn load_cached(&self) -> Result<bool> {
        let _guard = self.build_lock.lock().await;
        let fingerprint = Fingerprint::compute(
            &self.extractor.identity(),
            &self.embedder.model_id(),
            self.config.embedding.metric,
            &self.chunker().strategy_id(),
        );

        let loaded = match self.cache.load(&fingerprint).await {
            Ok(Some(cached)) => IndexSnapshot::from_cache(fingerprint, cached),
            Ok(None) => return Ok(false),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(snapshot) => {
                info!(
                    "Loaded cached index of {} tables built at {}",
                    snapshot.meta.table_count, snapshot.meta.built_at
                );
                self.swap_snapshot(Some(Arc::new(snapshot)));
                self.set_status(IndexStatus::Ready);
                Ok(true)
            }
            Err(SchemaSearchError::CacheCorruption(message)) => {
                warn!("Cached index is corrupt, clearing it: {}", message);
                self.cache.clear().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the cached and in-memory index
    #[inline]
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.build_lock.lock().await;
        self.cache.clear().await?;
        self.swap_snapshot(None);
        self.set_status(IndexStatus::NotIndexed);
        Ok(())
    }

    #[inline]
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<SearchResult>> {
        self.search_with_trace(request)
            .await
            .map(|outcome| outcome.results)
    }

    /// Search and report the candidate sets of each stage
    #[inline]
    pub async fn search_with_trace(&self, request: SearchRequest) -> Result<SearchOutcome> {
        let started = Instant::now();
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(SchemaSearchError::invalid_parameter(
                "query",
                "must not be empty",
            ));
        }
        let limit = request.limit.unwrap_or(self.config.search.limit);
        if limit == 0 {
            return Err(SchemaSearchError::invalid_parameter(
                "limit",
                "must be at least 1",
            ));
        }
        let hops = request.hops.unwrap_or(self.config.search.hops);
        if hops > MAX_HOPS {
            return Err(SchemaSearchError::invalid_parameter(
                "hops",
                format!("{} exceeds the maximum of {}", hops, MAX_HOPS),
            ));
        }
        let kind = match &request.strategy {
            Some(name) => name.parse::<StrategyKind>()?,
            None => self.config.search.strategy,
        };
        let strategy = build_strategy(kind, &self.config.search)?;

        let snapshot = self.snapshot().ok_or(SchemaSearchError::NotIndexed)?;
        debug!("Searching {:?} with {} (hops {}, limit {})", query, kind, hops, limit);

        let query_vector = if strategy.needs_query_embedding() {
            let embedder = Arc::clone(&self.embedder);
            let snapshot = Arc::clone(&snapshot);
            let text = query.clone();
            let vector = tokio::task::spawn_blocking(move || {
                snapshot
                    .corpus
                    .embeddings()
                    .embed_query(embedder.as_ref(), &text)
            })
            .await
            .context("Query embedding task failed")??;
            Some(vector)
        } else {
            None
        };

        let pass = {
            let snapshot = Arc::clone(&snapshot);
            let query = query.clone();
            let initial_top_k = self.config.search.initial_top_k;
            tokio::task::spawn_blocking(move || {
                score_candidates(
                    &snapshot,
                    strategy.as_ref(),
                    &query,
                    query_vector,
                    hops,
                    initial_top_k,
                )
            })
            .await
            .context("Scoring task failed")?
        };
        let expanded_candidates = {
            let mut expanded: Vec<String> =
                pass.expanded.iter().map(|s| s.table.clone()).collect();
            expanded.sort();
            expanded
        };

        let candidates: Vec<RerankCandidate> = pass
            .expanded
            .iter()
            .map(|scored| RerankCandidate {
                table: scored.table.clone(),
                score: scored.score,
                document: pass
                    .matched
                    .get(&scored.table)
                    .map(|texts| texts.join("\n\n"))
                    .unwrap_or_default(),
            })
            .collect();

        let reranker = Arc::clone(&self.reranker);
        let rerank_query = query.clone();
        let mut reranked = tokio::task::spawn_blocking(move || {
            reranker.rerank(&rerank_query, candidates)
        })
        .await
        .context("Rerank task failed")??;
        if let Some(top_k) = self.reranker.top_k(self.config.search.rerank_top_k) {
            reranked.truncate(top_k);
        }
        reranked.truncate(limit);

        let ScoringPass {
            initial,
            mut matched,
            ..
        } = pass;
        let results = reranked
            .into_iter()
            .filter_map(|candidate| {
                let schema = snapshot.corpus.table(&candidate.table)?.clone();
                Some(SearchResult {
                    related_tables: snapshot.graph.related(&candidate.table, hops),
                    matched_chunks: matched.remove(&candidate.table).unwrap_or_default(),
                    table: candidate.table,
                    score: candidate.score,
                    schema,
                })
            })
            .collect::<Vec<_>>();

        let elapsed = started.elapsed();
        info!(
            "Search {:?} returned {} results from {} candidates in {:.2?}",
            query,
            results.len(),
            expanded_candidates.len(),
            elapsed
        );

        Ok(SearchOutcome {
            results,
            initial_candidates: initial,
            expanded_candidates,
            elapsed,
        })
    }
}

/// Keep the first table of every identifier
fn dedup_tables(tables: Vec<Table>) -> Vec<Table> {
    let mut seen = HashSet::new();
    tables
        .into_iter()
        .filter(|table| {
            let fresh = seen.insert(table.id());
            if !fresh {
                warn!("Ignoring duplicate definition of table {}", table.id());
            }
            fresh
        })
        .collect()
}

/// Score every table, keep the top `initial_top_k`, expand them through the
/// graph and re-score the expanded set with the same query state
fn score_candidates(
    snapshot: &IndexSnapshot,
    strategy: &dyn ScoringStrategy,
    query: &str,
    query_vector: Option<Vec<f32>>,
    hops: usize,
    initial_top_k: usize,
) -> ScoringPass {
    let corpus = &snapshot.corpus;
    let ctx = ScoringContext::new(corpus, query, query_vector);

    let mut initial = rank_tables(strategy, &ctx, corpus.table_ids());
    initial.truncate(initial_top_k);
    let initial: Vec<String> = initial.into_iter().map(|s| s.table).collect();

    let expanded_ids = snapshot.graph.expand(&initial, hops);
    let expanded = rank_tables(
        strategy,
        &ctx,
        expanded_ids
            .iter()
            .map(String::as_str)
            .filter(|id| corpus.table(id).is_some()),
    );

    let matched = expanded
        .iter()
        .map(|scored| {
            (
                scored.table.clone(),
                matched_chunks(strategy, &ctx, &scored.table),
            )
        })
        .collect();

    ScoringPass {
        initial,
        expanded,
        matched,
    }
}

/// Chunk texts of `table`, best chunk first for chunk-level strategies and in
/// position order otherwise
fn matched_chunks(strategy: &dyn ScoringStrategy, ctx: &ScoringContext<'_>, table: &str) -> Vec<String> {
    let corpus = ctx.corpus();
    let mut indices: Vec<(usize, Option<f32>)> = corpus
        .chunks_of(table)
        .iter()
        .map(|&i| (i, strategy.chunk_score(ctx, i)))
        .collect();
    if indices.iter().all(|(_, score)| score.is_some()) {
        indices.sort_by(|a, b| {
            let (score_a, score_b) = (a.1.unwrap_or(0.0), b.1.unwrap_or(0.0));
            score_b
                .total_cmp(&score_a)
                .then_with(|| corpus.chunks()[a.0].position.cmp(&corpus.chunks()[b.0].position))
        });
    }
    indices
        .into_iter()
        .map(|(i, _)| corpus.chunks()[i].text.clone())
        .collect()
}
