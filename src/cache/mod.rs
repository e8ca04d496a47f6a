
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, Transaction};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::chunking::Chunk;
use crate::embeddings::{EmbeddingStore, VectorMetric};
use crate::graph::{FkEdge, GraphSnapshot};
use crate::schema::Table;
use crate::{Result, SchemaSearchError};

pub type CachePool = Pool<Sqlite>;

const FINGERPRINT_KEY: &str = "fingerprint";

/// Digest of everything a cached index is only valid under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[inline]
    pub fn compute(
        database: &str,
        model_id: &str,
        metric: VectorMetric,
        chunking_strategy: &str,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [database, model_id, &metric.to_string(), chunking_strategy] {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptive metadata stored alongside a valid cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMeta {
    pub fingerprint: String,
    pub database: String,
    pub embedding_model: String,
    pub metric: VectorMetric,
    pub dimension: usize,
    pub chunking_strategy: String,
    pub table_count: usize,
    pub chunk_count: usize,
    pub built_at: DateTime<Utc>,
}

/// Everything one successful `index()` produces
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub meta: CacheMeta,
    pub tables: Vec<Table>,
    pub chunks: Vec<Chunk>,
    pub embeddings: EmbeddingStore,
    pub graph: GraphSnapshot,
    pub summaries: HashMap<String, String>,
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    chunk_id: String,
    table_id: String,
    position: i64,
    text: String,
    token_count: i64,
    overlap_lines: i64,
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    from_table: String,
    from_columns: String,
    to_table: String,
    to_columns: String,
}

/// SQLite-backed store for one index snapshot.
///
/// A snapshot is written in a single transaction that replaces the previous
/// one, with the fingerprint row inserted last. Readers never observe a
/// half-written snapshot.
#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: CachePool,
    path: PathBuf,
}

impl CacheStore {
    #[inline]
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::open_inner(&path)
            .await
            .map_err(|e| SchemaSearchError::Cache(format!("{:#}", e)))
    }

    async fn open_inner(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open cache at {}", path.display()))?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        debug!("Running cache migrations on {}", self.path.display());

        sqlx::migrate!("src/cache/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run cache migration")?;

        Ok(())
    }

    #[inline]
    pub fn pool(&self) -> &CachePool {
        &self.pool
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot. Either the whole snapshot is committed
    /// or the previous one is left untouched.
    #[inline]
    pub async fn persist(&self, snapshot: &CacheSnapshot) -> Result<()> {
        self.persist_inner(snapshot)
            .await
            .map_err(|e| SchemaSearchError::Cache(format!("Failed to persist index: {:#}", e)))?;
        info!(
            "Persisted index {} ({} tables, {} chunks) to {}",
            snapshot.meta.fingerprint,
            snapshot.tables.len(),
            snapshot.chunks.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn persist_inner(&self, snapshot: &CacheSnapshot) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        delete_all(&mut tx).await?;

        for (position, table) in snapshot.tables.iter().enumerate() {
            let definition =
                serde_json::to_string(table).context("Failed to serialize table definition")?;
            sqlx::query(
                "INSERT INTO schema_tables (position, table_id, definition) VALUES (?, ?, ?)",
            )
            .bind(position as i64)
            .bind(table.id())
            .bind(definition)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to store table {}", table.id()))?;
        }

        for (ordinal, chunk) in snapshot.chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (ordinal, chunk_id, table_id, position, text, token_count, overlap_lines)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(ordinal as i64)
            .bind(&chunk.id)
            .bind(&chunk.table)
            .bind(chunk.position as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(chunk.overlap_lines as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to store chunk")?;
        }

        for (chunk_id, vector) in &snapshot.embeddings.vectors {
            let blob = bincode::serialize(vector).context("Failed to encode vector")?;
            sqlx::query("INSERT INTO embeddings (chunk_id, vector) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(blob)
                .execute(&mut *tx)
                .await
                .context("Failed to store embedding")?;
        }

        for (position, node) in snapshot.graph.nodes.iter().enumerate() {
            sqlx::query("INSERT INTO graph_nodes (position, table_id) VALUES (?, ?)")
                .bind(position as i64)
                .bind(node)
                .execute(&mut *tx)
                .await
                .context("Failed to store graph node")?;
        }

        for (position, edge) in snapshot.graph.edges.iter().enumerate() {
            sqlx::query(
                "INSERT INTO graph_edges (position, from_table, from_columns, to_table, to_columns)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&edge.from_table)
            .bind(serde_json::to_string(&edge.from_columns)?)
            .bind(&edge.to_table)
            .bind(serde_json::to_string(&edge.to_columns)?)
            .execute(&mut *tx)
            .await
            .context("Failed to store graph edge")?;
        }

        for (key, summary) in &snapshot.summaries {
            sqlx::query("INSERT INTO summaries (summary_key, summary) VALUES (?, ?)")
                .bind(key)
                .bind(summary)
                .execute(&mut *tx)
                .await
                .context("Failed to store summary")?;
        }

        let meta = &snapshot.meta;
        let entries = [
            ("database", meta.database.clone()),
            ("embedding_model", meta.embedding_model.clone()),
            ("metric", meta.metric.to_string()),
            ("dimension", meta.dimension.to_string()),
            ("chunking_strategy", meta.chunking_strategy.clone()),
            ("table_count", meta.table_count.to_string()),
            ("chunk_count", meta.chunk_count.to_string()),
            ("built_at", meta.built_at.to_rfc3339()),
            (FINGERPRINT_KEY, meta.fingerprint.clone()),
        ];
        for (key, value) in entries {
            sqlx::query("INSERT INTO cache_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to store {}", key))?;
        }

        tx.commit().await.context("Failed to commit index")?;
        Ok(())
    }

    /// Metadata of the stored snapshot, `None` when nothing valid is stored
    #[inline]
    pub async fn meta(&self) -> Result<Option<CacheMeta>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM cache_meta")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SchemaSearchError::Cache(format!("Failed to read cache metadata: {}", e)))?;
        let values: HashMap<String, String> = rows.into_iter().collect();

        if !values.contains_key(FINGERPRINT_KEY) {
            return Ok(None);
        }
        parse_meta(&values).map(Some)
    }

    /// Load the stored snapshot if it was built under `expected`
    #[inline]
    pub async fn load(&self, expected: &Fingerprint) -> Result<Option<CacheSnapshot>> {
        let Some(meta) = self.meta().await? else {
            debug!("No valid index cached in {}", self.path.display());
            return Ok(None);
        };
        if meta.fingerprint != expected.as_str() {
            info!(
                "Cached index {} does not match {}; a rebuild is required",
                meta.fingerprint, expected
            );
            return Ok(None);
        }

        let tables = self.load_tables().await?;
        let chunks = self.load_chunks().await?;
        let vectors = self.load_vectors().await?;
        let graph = self.load_graph().await?;
        let summaries = self.load_summaries().await?;

        let embeddings = EmbeddingStore {
            model_id: meta.embedding_model.clone(),
            metric: meta.metric,
            dimension: meta.dimension,
            vectors,
        };
        embeddings
            .validate()
            .map_err(SchemaSearchError::CacheCorruption)?;
        if let Some(chunk) = chunks
            .iter()
            .find(|c| !embeddings.vectors.contains_key(&c.id))
        {
            return Err(SchemaSearchError::CacheCorruption(format!(
                "chunk {} has no embedding",
                chunk.id
            )));
        }
        if tables.len() != meta.table_count || chunks.len() != meta.chunk_count {
            return Err(SchemaSearchError::CacheCorruption(format!(
                "expected {} tables and {} chunks, found {} and {}",
                meta.table_count,
                meta.chunk_count,
                tables.len(),
                chunks.len()
            )));
        }

        Ok(Some(CacheSnapshot {
            meta,
            tables,
            chunks,
            embeddings,
            graph,
            summaries,
        }))
    }

    /// Embeddings of the stored snapshot whatever its fingerprint, for reuse
    /// by the next build
    #[inline]
    pub async fn load_embeddings(&self) -> Result<Option<EmbeddingStore>> {
        let Some(meta) = self.meta().await? else {
            return Ok(None);
        };
        let vectors = self.load_vectors().await?;
        let store = EmbeddingStore {
            model_id: meta.embedding_model,
            metric: meta.metric,
            dimension: meta.dimension,
            vectors,
        };
        store.validate().map_err(SchemaSearchError::CacheCorruption)?;
        Ok(Some(store))
    }

    /// Summaries produced by earlier builds, keyed by summary key
    #[inline]
    pub async fn load_summaries(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT summary_key, summary FROM summaries")
                .fetch_all(&self.pool)
                .await
                .map_err(read_error("summaries"))?;
        Ok(rows.into_iter().collect())
    }

    async fn load_tables(&self) -> Result<Vec<Table>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT table_id, definition FROM schema_tables ORDER BY position")
                .fetch_all(&self.pool)
                .await
                .map_err(read_error("tables"))?;

        rows.into_iter()
            .map(|(table_id, definition)| {
                let table: Table = serde_json::from_str(&definition).map_err(|e| {
                    SchemaSearchError::CacheCorruption(format!(
                        "table {} cannot be decoded: {}",
                        table_id, e
                    ))
                })?;
                if table.id() != table_id {
                    return Err(SchemaSearchError::CacheCorruption(format!(
                        "table row {} holds definition of {}",
                        table_id,
                        table.id()
                    )));
                }
                Ok(table)
            })
            .collect()
    }

    async fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            "SELECT chunk_id, table_id, position, text, token_count, overlap_lines
             FROM chunks ORDER BY ordinal",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("chunks"))?;

        rows.into_iter()
            .map(|row| {
                Ok(Chunk {
                    position: to_usize(row.position, "chunk position")?,
                    token_count: to_usize(row.token_count, "chunk token count")?,
                    overlap_lines: to_usize(row.overlap_lines, "chunk overlap")?,
                    id: row.chunk_id,
                    table: row.table_id,
                    text: row.text,
                })
            })
            .collect()
    }

    async fn load_vectors(&self) -> Result<HashMap<String, Vec<f32>>> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as("SELECT chunk_id, vector FROM embeddings")
            .fetch_all(&self.pool)
            .await
            .map_err(read_error("embeddings"))?;

        rows.into_iter()
            .map(|(chunk_id, blob)| {
                let vector: Vec<f32> = bincode::deserialize(&blob).map_err(|e| {
                    SchemaSearchError::CacheCorruption(format!(
                        "embedding for chunk {} cannot be decoded: {}",
                        chunk_id, e
                    ))
                })?;
                Ok((chunk_id, vector))
            })
            .collect()
    }

    async fn load_graph(&self) -> Result<GraphSnapshot> {
        let nodes: Vec<String> =
            sqlx::query_scalar("SELECT table_id FROM graph_nodes ORDER BY position")
                .fetch_all(&self.pool)
                .await
                .map_err(read_error("graph nodes"))?;
        let rows: Vec<EdgeRow> = sqlx::query_as(
            "SELECT from_table, from_columns, to_table, to_columns FROM graph_edges ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_error("graph edges"))?;

        let edges = rows
            .into_iter()
            .map(|row| {
                let decode = |columns: &str| {
                    serde_json::from_str::<Vec<String>>(columns).map_err(|e| {
                        SchemaSearchError::CacheCorruption(format!(
                            "edge {} -> {} has invalid columns: {}",
                            row.from_table, row.to_table, e
                        ))
                    })
                };
                Ok(FkEdge {
                    from_columns: decode(&row.from_columns)?,
                    to_columns: decode(&row.to_columns)?,
                    from_table: row.from_table.clone(),
                    to_table: row.to_table.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(GraphSnapshot { nodes, edges })
    }

    /// Delete the stored snapshot and summaries
    #[inline]
    pub async fn clear(&self) -> Result<()> {
        let result: anyhow::Result<()> = async {
            let mut tx = self.pool.begin().await?;
            delete_all(&mut tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        result.map_err(|e| SchemaSearchError::Cache(format!("{:#}", e)))?;
        warn!("Cleared index cache at {}", self.path.display());
        Ok(())
    }
}

/// Every table holding snapshot data, metadata first
const CACHE_TABLES: [&str; 7] = [
    "cache_meta",
    "schema_tables",
    "chunks",
    "embeddings",
    "graph_nodes",
    "graph_edges",
    "summaries",
];

async fn delete_all(tx: &mut Transaction<'_, Sqlite>) -> anyhow::Result<()> {
    for table in CACHE_TABLES {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to clear {}", table))?;
    }
    Ok(())
}

fn read_error(what: &'static str) -> impl Fn(sqlx::Error) -> SchemaSearchError {
    move |e| SchemaSearchError::Cache(format!("Failed to read cached {}: {}", what, e))
}

fn to_usize(value: i64, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        SchemaSearchError::CacheCorruption(format!("{} is negative: {}", what, value))
    })
}

fn parse_meta(values: &HashMap<String, String>) -> Result<CacheMeta> {
    let get = |key: &str| {
        values.get(key).cloned().ok_or_else(|| {
            SchemaSearchError::CacheCorruption(format!("cache metadata is missing {}", key))
        })
    };
    let number = |key: &str| {
        get(key)?.parse::<usize>().map_err(|e| {
            SchemaSearchError::CacheCorruption(format!("cache metadata {} is invalid: {}", key, e))
        })
    };

    let metric: VectorMetric = get("metric")?
        .parse()
        .map_err(|e: String| SchemaSearchError::CacheCorruption(e))?;
    let built_at = DateTime::parse_from_rfc3339(&get("built_at")?)
        .map_err(|e| SchemaSearchError::CacheCorruption(format!("invalid build time: {}", e)))?
        .with_timezone(&Utc);

    Ok(CacheMeta {
        fingerprint: get(FINGERPRINT_KEY)?,
        database: get("database")?,
        embedding_model: get("embedding_model")?,
        metric,
        dimension: number("dimension")?,
        chunking_strategy: get("chunking_strategy")?,
        table_count: number("table_count")?,
        chunk_count: number("chunk_count")?,
        built_at,
    })
}
