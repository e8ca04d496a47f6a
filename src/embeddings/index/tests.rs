use super::*;
use crate::chunking::{ChunkingConfig, Chunker};
use crate::embeddings::HashingEmbedder;
use crate::schema::Table;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Hashing embedder that counts how many texts it was asked to embed
struct CountingEmbedder {
    inner: HashingEmbedder,
    embedded: AtomicUsize,
}

impl CountingEmbedder {
    fn new(dimension: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dimension),
            embedded: AtomicUsize::new(0),
        }
    }

    fn embedded(&self) -> usize {
        self.embedded.load(AtomicOrdering::SeqCst)
    }
}

impl Embedder for CountingEmbedder {
    fn model_id(&self) -> String {
        self.inner.model_id()
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.embedded.fetch_add(texts.len(), AtomicOrdering::SeqCst);
        self.inner.embed_batch(texts)
    }
}

struct RaggedEmbedder;

impl Embedder for RaggedEmbedder {
    fn model_id(&self) -> String {
        "ragged".to_string()
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![1.0; t.len() % 3 + 1]).collect())
    }
}

struct BrokenEmbedder;

impl Embedder for BrokenEmbedder {
    fn model_id(&self) -> String {
        "broken".to_string()
    }

    fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("connection refused")
    }
}

fn shop_chunks() -> Vec<Chunk> {
    let tables = vec![
        Table::new(None, "customers")
            .with_column("id", "INTEGER", false)
            .with_column("email", "TEXT", false),
        Table::new(None, "orders")
            .with_column("id", "INTEGER", false)
            .with_column("customer_id", "INTEGER", false)
            .with_foreign_key(&["customer_id"], "customers", &["id"]),
        Table::new(None, "products").with_column("sku", "TEXT", false),
    ];
    Chunker::new(ChunkingConfig::default())
        .chunk_tables(&tables)
        .expect("chunking should succeed")
        .chunks
}

fn build(
    chunks: &[Chunk],
    embedder: &dyn Embedder,
    metric: VectorMetric,
    previous: Option<&EmbeddingStore>,
) -> Result<(EmbeddingIndex, EmbeddingBuildStats)> {
    EmbeddingIndex::build(chunks, embedder, metric, 2, previous, &ProgressBar::hidden())
}

#[test]
fn first_build_embeds_every_chunk() {
    let chunks = shop_chunks();
    let embedder = CountingEmbedder::new(64);

    let (index, stats) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    assert_eq!(stats.computed, chunks.len());
    assert_eq!(stats.reused, 0);
    assert_eq!(index.len(), chunks.len());
    assert_eq!(index.store().dimension, 64);
    assert_eq!(embedder.embedded(), chunks.len());
}

#[test]
fn unchanged_chunks_are_reused() {
    let chunks = shop_chunks();
    let embedder = CountingEmbedder::new(64);
    let (first, _) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    let (second, stats) = build(&chunks, &embedder, VectorMetric::Cosine, Some(first.store()))
        .expect("rebuild should succeed");

    assert_eq!(stats.computed, 0);
    assert_eq!(stats.reused, chunks.len());
    assert_eq!(embedder.embedded(), chunks.len());
    assert_eq!(first.store(), second.store());
}

#[test]
fn only_changed_chunks_are_recomputed() {
    let mut chunks = shop_chunks();
    let embedder = CountingEmbedder::new(64);
    let (first, _) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    chunks[0].id = "changed".to_string();
    chunks[0].text.push_str("\n- **name**: `TEXT` NULL");
    let (second, stats) = build(&chunks, &embedder, VectorMetric::Cosine, Some(first.store()))
        .expect("rebuild should succeed");

    assert_eq!(stats.computed, 1);
    assert_eq!(stats.reused, chunks.len() - 1);
    assert!(second.vector("changed").is_some());
    assert_eq!(second.len(), chunks.len());
}

#[test]
fn model_change_discards_previous_store() {
    let chunks = shop_chunks();
    let (first, _) = build(
        &chunks,
        &HashingEmbedder::new(64),
        VectorMetric::Cosine,
        None,
    )
    .expect("build should succeed");

    let embedder = CountingEmbedder::new(128);
    let (second, stats) = build(&chunks, &embedder, VectorMetric::Cosine, Some(first.store()))
        .expect("rebuild should succeed");

    assert_eq!(stats.computed, chunks.len());
    assert_eq!(stats.reused, 0);
    assert_eq!(second.store().dimension, 128);
}

#[test]
fn metric_change_discards_previous_store() {
    let chunks = shop_chunks();
    let embedder = CountingEmbedder::new(64);
    let (first, _) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    let (_, stats) = build(&chunks, &embedder, VectorMetric::Dot, Some(first.store()))
        .expect("rebuild should succeed");
    assert_eq!(stats.computed, chunks.len());
}

#[test]
fn stale_chunks_are_dropped() {
    let chunks = shop_chunks();
    let embedder = HashingEmbedder::new(64);
    let (first, _) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    let (second, _) = build(&chunks[1..], &embedder, VectorMetric::Cosine, Some(first.store()))
        .expect("rebuild should succeed");
    assert!(second.vector(&chunks[0].id).is_none());
    assert_eq!(second.len(), chunks.len() - 1);
}

#[test]
fn mixed_dimensions_are_rejected() {
    let chunks = shop_chunks();
    let result = build(&chunks, &RaggedEmbedder, VectorMetric::Cosine, None);
    assert!(matches!(result, Err(SchemaSearchError::Embedding(_))));
}

#[test]
fn embedder_failure_is_an_embedding_error() {
    let chunks = shop_chunks();
    let result = build(&chunks, &BrokenEmbedder, VectorMetric::Cosine, None);
    match result {
        Err(SchemaSearchError::Embedding(message)) => {
            assert!(message.contains("connection refused"));
        }
        other => panic!("expected embedding error, got {:?}", other.map(|(_, s)| s)),
    }
}

#[test]
fn query_ranks_by_similarity() {
    let chunks = shop_chunks();
    let embedder = HashingEmbedder::new(256);
    let (index, _) =
        build(&chunks, &embedder, VectorMetric::Cosine, None).expect("build should succeed");

    let hits = index
        .query(&embedder, "customer email", 2)
        .expect("query should succeed");
    assert_eq!(hits.len(), 2);
    let top = chunks
        .iter()
        .find(|c| c.id == hits[0].0)
        .expect("hit should be a known chunk");
    assert_eq!(top.table, "customers");
    assert!(hits[0].1 >= hits[1].1);
}

#[test]
fn query_rejects_foreign_model() {
    let chunks = shop_chunks();
    let (index, _) = build(
        &chunks,
        &HashingEmbedder::new(64),
        VectorMetric::Cosine,
        None,
    )
    .expect("build should succeed");

    let result = index.query(&HashingEmbedder::new(32), "orders", 3);
    assert!(matches!(result, Err(SchemaSearchError::Embedding(_))));
}

#[test]
fn ties_break_by_identifier() {
    let mut vectors = HashMap::new();
    vectors.insert("b".to_string(), vec![1.0, 0.0]);
    vectors.insert("a".to_string(), vec![1.0, 0.0]);
    vectors.insert("c".to_string(), vec![0.0, 1.0]);
    let index = EmbeddingIndex::from_store(EmbeddingStore {
        model_id: "fixed".to_string(),
        metric: VectorMetric::Dot,
        dimension: 2,
        vectors,
    })
    .expect("store should be valid");

    struct Fixed;
    impl Embedder for Fixed {
        fn model_id(&self) -> String {
            "fixed".to_string()
        }
        fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    let hits = index.query(&Fixed, "anything", 3).expect("query should succeed");
    let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn invalid_store_is_rejected() {
    let mut vectors = HashMap::new();
    vectors.insert("a".to_string(), vec![1.0, 0.0, 0.0]);
    let result = EmbeddingIndex::from_store(EmbeddingStore {
        model_id: "fixed".to_string(),
        metric: VectorMetric::Cosine,
        dimension: 2,
        vectors,
    });
    assert!(result.is_err());
}
