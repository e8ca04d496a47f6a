use super::estimate_token_count as estimate_token_count_impl;
use super::*;
use crate::schema::Table;
use std::sync::atomic::{AtomicUsize, Ordering};

fn orders_table() -> Table {
    Table::new(Some("public"), "orders")
        .with_column("id", "INTEGER", false)
        .with_column("customer_id", "INTEGER", false)
        .with_column("placed_at", "TIMESTAMP", true)
        .with_primary_key(&["id"])
        .with_foreign_key(&["customer_id"], "public.customers", &["id"])
}

fn wide_table(columns: usize) -> Table {
    let mut table = Table::new(Some("public"), "wide");
    for i in 0..columns {
        table = table.with_column(&format!("col_{}", i), "INTEGER", true);
    }
    table
        .with_primary_key(&["col_0"])
        .with_foreign_key(&["col_1"], "public.orders", &["id"])
        .with_foreign_key(&["col_2", "col_3"], "public.pairs", &["left_id", "right_id"])
}

fn small_config() -> ChunkingConfig {
    ChunkingConfig {
        max_tokens: 64,
        overlap_tokens: 12,
        ..ChunkingConfig::default()
    }
}

struct FixedSummarizer {
    text: String,
    calls: AtomicUsize,
}

impl FixedSummarizer {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TextSummarizer for FixedSummarizer {
    fn id(&self) -> String {
        "fixed".to_string()
    }

    fn summarize(&self, _table: &Table, _serialized: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

struct FailingSummarizer;

impl TextSummarizer for FailingSummarizer {
    fn id(&self) -> String {
        "failing".to_string()
    }

    fn summarize(&self, table: &Table, _serialized: &str) -> anyhow::Result<String> {
        if table.name == "orders" {
            anyhow::bail!("model timed out")
        }
        Ok(format!("Summary of {}", table.name))
    }
}

fn summarized_config() -> ChunkingConfig {
    ChunkingConfig {
        strategy: ChunkingStrategy::Summarized,
        ..ChunkingConfig::default()
    }
}

#[test]
fn estimate_token_count() {
    assert_eq!(estimate_token_count_impl("hello world"), 2);
    assert_eq!(estimate_token_count_impl("This is a test."), 5);
    assert_eq!(estimate_token_count_impl(""), 0);
}

#[test]
fn render_table_sections() {
    let rendered = render_table(&orders_table());
    let lines: Vec<&str> = rendered.lines().collect();

    assert_eq!(lines[0], "# Table: public.orders");
    assert_eq!(lines[1], "## Columns");
    assert_eq!(lines[2], "- **id**: `INTEGER` NOT NULL [PK]");
    assert_eq!(lines[4], "- **placed_at**: `TIMESTAMP` NULL");
    assert!(rendered.contains("## Primary Key\n- id"));
    assert!(rendered.contains("- `customer_id` → `public.customers.id`"));
    assert!(!rendered.contains("## Indices"));
    assert!(!rendered.ends_with('\n'));
}

#[test]
fn small_table_is_one_chunk() {
    let chunker = Chunker::new(ChunkingConfig::default());
    let chunks = chunker
        .chunk_table(&orders_table())
        .expect("chunking should succeed");

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].table, "public.orders");
    assert_eq!(chunks[0].overlap_lines, 0);
    assert_eq!(chunks[0].text, render_table(&orders_table()));
}

#[test]
fn chunks_stay_within_budget() {
    let config = small_config();
    let chunks = Chunker::new(config.clone())
        .chunk_table(&wide_table(40))
        .expect("chunking should succeed");

    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.text.starts_with("# Table: public.wide\n"));
        assert!(
            chunk.token_count <= config.max_tokens,
            "chunk {} has {} tokens",
            chunk.position,
            chunk.token_count
        );
    }
    let positions: Vec<usize> = chunks.iter().map(|c| c.position).collect();
    assert_eq!(positions, (0..chunks.len()).collect::<Vec<_>>());
}

#[test]
fn chunks_reconstruct_the_table() {
    let table = wide_table(40);
    let chunks = Chunker::new(small_config())
        .chunk_table(&table)
        .expect("chunking should succeed");

    let reconstructed: Vec<&str> = chunks
        .iter()
        .flat_map(|chunk| chunk.body_lines().skip(chunk.overlap_lines))
        .collect();
    let rendered = render_table(&table);
    let expected: Vec<&str> = rendered.lines().skip(1).collect();
    assert_eq!(reconstructed, expected);
}

#[test]
fn consecutive_chunks_overlap() {
    let config = small_config();
    let chunks = Chunker::new(config.clone())
        .chunk_table(&wide_table(40))
        .expect("chunking should succeed");

    for pair in chunks.windows(2) {
        let previous: Vec<&str> = pair[0].body_lines().collect();
        let shared: Vec<&str> = pair[1].body_lines().take(pair[1].overlap_lines).collect();

        assert!(!shared.is_empty());
        assert_eq!(shared, previous[previous.len() - shared.len()..]);
        assert!(estimate_token_count_impl(&shared.join("\n")) >= config.overlap_tokens);
    }
}

#[test]
fn foreign_keys_are_never_split() {
    let table = wide_table(40);
    let chunks = Chunker::new(small_config())
        .chunk_table(&table)
        .expect("chunking should succeed");

    for line in [
        "- `col_1` → `public.orders.id`",
        "- `col_2, col_3` → `public.pairs.left_id, right_id`",
    ] {
        assert!(
            chunks.iter().any(|c| c.body_lines().any(|l| l == line)),
            "missing {}",
            line
        );
    }
}

#[test]
fn oversized_line_gets_its_own_chunk() {
    let long_type = "VARCHAR ".repeat(80);
    let table = Table::new(None, "blob")
        .with_column("id", "INTEGER", false)
        .with_column("payload", long_type.trim(), true);

    let chunks = Chunker::new(small_config())
        .chunk_table(&table)
        .expect("chunking should succeed");

    let oversized: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| c.text.contains("**payload**"))
        .collect();
    assert_eq!(oversized.len(), 1);
    assert_eq!(oversized[0].body_lines().count(), 1);
}

#[test]
fn chunk_ids_are_content_addressed() {
    let table = orders_table();
    let first = Chunker::new(ChunkingConfig::default())
        .chunk_table(&table)
        .expect("chunking should succeed");
    let second = Chunker::new(ChunkingConfig::default())
        .chunk_table(&table)
        .expect("chunking should succeed");
    assert_eq!(first[0].id, second[0].id);

    let other_strategy = Chunker::new(ChunkingConfig {
        overlap_tokens: 8,
        ..ChunkingConfig::default()
    })
    .chunk_table(&table)
    .expect("chunking should succeed");
    assert_eq!(first[0].text, other_strategy[0].text);
    assert_ne!(first[0].id, other_strategy[0].id);

    let changed = Chunker::new(ChunkingConfig::default())
        .chunk_table(&table.with_column("total", "NUMERIC", true))
        .expect("chunking should succeed");
    assert_ne!(first[0].id, changed[0].id);
}

#[test]
fn strategy_id_tracks_configuration() {
    let raw = Chunker::new(ChunkingConfig::default());
    assert_eq!(raw.strategy_id(), "raw:max256:overlap32");

    let summarized = Chunker::new(summarized_config())
        .with_summarizer(Arc::new(FixedSummarizer::new("text")));
    assert_eq!(summarized.strategy_id(), "summarized:fixed:max256:overlap32");
}

#[test]
fn summarized_chunks_use_summary_text() {
    let chunker = Chunker::new(summarized_config())
        .with_summarizer(Arc::new(FixedSummarizer::new("Orders placed by customers.")));

    let outcome = chunker
        .chunk_tables(&[orders_table()])
        .expect("chunking should succeed");

    assert_eq!(outcome.chunks.len(), 1);
    assert_eq!(
        outcome.chunks[0].text,
        "# Table: public.orders\nOrders placed by customers."
    );
    assert_eq!(outcome.summaries.len(), 1);
}

#[test]
fn summarizer_failure_excludes_table() {
    let customers = Table::new(Some("public"), "customers").with_column("id", "INTEGER", false);
    let chunker =
        Chunker::new(summarized_config()).with_summarizer(Arc::new(FailingSummarizer));

    let outcome = chunker
        .chunk_tables(&[orders_table(), customers])
        .expect("non-strict chunking should succeed");

    assert!(outcome.chunks.iter().all(|c| c.table == "public.customers"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].table, "public.orders");
    assert!(outcome.failures[0].message.contains("model timed out"));
}

#[test]
fn strict_mode_aborts_on_failure() {
    let chunker = Chunker::new(ChunkingConfig {
        strict: true,
        ..summarized_config()
    })
    .with_summarizer(Arc::new(FailingSummarizer));

    let result = chunker.chunk_tables(&[orders_table()]);
    assert!(matches!(
        result,
        Err(SchemaSearchError::Chunking { ref table, .. }) if table == "public.orders"
    ));
}

#[test]
fn empty_summary_is_a_failure() {
    let chunker = Chunker::new(summarized_config())
        .with_summarizer(Arc::new(FixedSummarizer::new("   ")));

    let outcome = chunker
        .chunk_tables(&[orders_table()])
        .expect("non-strict chunking should succeed");
    assert!(outcome.chunks.is_empty());
    assert_eq!(outcome.failures.len(), 1);
}

#[test]
fn cached_summaries_skip_the_summarizer() {
    let summarizer = Arc::new(FixedSummarizer::new("Orders placed by customers."));
    let first = Chunker::new(summarized_config())
        .with_summarizer(Arc::clone(&summarizer) as Arc<dyn TextSummarizer>)
        .chunk_tables(&[orders_table()])
        .expect("chunking should succeed");
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

    let second = Chunker::new(summarized_config())
        .with_summarizer(Arc::clone(&summarizer) as Arc<dyn TextSummarizer>)
        .with_summary_cache(first.summaries.clone())
        .chunk_tables(&[orders_table()])
        .expect("chunking should succeed");

    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.chunks, second.chunks);
    assert_eq!(first.summaries, second.summaries);
}

#[test]
fn summarized_without_summarizer_is_rejected() {
    let result = Chunker::new(summarized_config()).chunk_tables(&[orders_table()]);
    assert!(matches!(result, Err(SchemaSearchError::Config(_))));
}

#[test]
fn long_summary_lines_are_wrapped() {
    let text = "This table records every order a customer places together with timestamps totals and fulfilment state. "
        .repeat(10);
    let config = ChunkingConfig {
        max_tokens: 64,
        overlap_tokens: 8,
        ..summarized_config()
    };
    let chunks = Chunker::new(config)
        .with_summarizer(Arc::new(FixedSummarizer::new(&text)))
        .chunk_table(&orders_table())
        .expect("chunking should succeed");

    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| c.token_count <= 64));
}
