use anyhow::{Context, Result};
use itertools::Itertools;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::{Config, EmbeddingProvider, describe_config};
use crate::embeddings::OllamaEmbedder;
use crate::schema::SqliteExtractor;
use crate::search::{IndexMode, SchemaSearch, SearchRequest, SearchResult};

/// Setting overrides accepted by the `config` subcommand
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub ollama_protocol: Option<String>,
    pub ollama_host: Option<String>,
    pub ollama_port: Option<u16>,
    pub embedding_model: Option<String>,
    pub batch_size: Option<u32>,
}

impl ConfigUpdate {
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the overrides, validating each one
    #[inline]
    pub fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(protocol) = self.ollama_protocol {
            config.ollama.set_protocol(protocol)?;
        }
        if let Some(host) = self.ollama_host {
            config.ollama.set_host(host)?;
        }
        if let Some(port) = self.ollama_port {
            config.ollama.set_port(port)?;
        }
        if let Some(model) = self.embedding_model {
            config.embedding.set_model(model)?;
        }
        if let Some(batch_size) = self.batch_size {
            config.embedding.set_batch_size(batch_size)?;
        }
        Ok(())
    }
}

async fn open_engine(config: Config, database: &Path) -> Result<SchemaSearch> {
    let extractor = SqliteExtractor::open(database)
        .await
        .context("Failed to open database")?;
    let engine = SchemaSearch::from_config(config, Arc::new(extractor)).await?;
    Ok(engine)
}

/// Build (or refresh) the index for a SQLite database
#[inline]
pub async fn index_database(config: Config, database: &Path, force: bool) -> Result<()> {
    let engine = open_engine(config, database).await?;
    let mode = if force {
        IndexMode::Force
    } else {
        IndexMode::Incremental
    };
    let stats = engine.index(mode).await?;

    println!("Indexed {}", database.display());
    println!("  Tables: {}", stats.table_count);
    println!("  Chunks: {}", stats.chunk_count);
    println!(
        "  Embeddings: {} computed, {} reused",
        stats.embeddings_computed, stats.embeddings_reused
    );
    if !stats.failed_tables.is_empty() {
        println!("  Excluded tables: {}", stats.failed_tables.join(", "));
    }
    println!("  Duration: {:.2?}", stats.elapsed);
    Ok(())
}

/// Search a SQLite database, indexing it first when no valid cache exists
#[inline]
pub async fn search_database(config: Config, database: &Path, request: SearchRequest) -> Result<()> {
    let engine = open_engine(config, database).await?;
    if !engine.load_cached().await? {
        info!("No usable cached index, indexing {}", database.display());
        engine.index(IndexMode::Incremental).await?;
    }

    let results = engine.search(request).await?;
    if results.is_empty() {
        println!("No matching tables.");
        return Ok(());
    }
    for (rank, result) in results.iter().enumerate() {
        print_result(rank + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &SearchResult) {
    println!("{}. {} (score {:.4})", rank, result.table, result.score);
    println!(
        "   Columns: {}",
        result.schema.columns.iter().map(|c| &c.name).join(", ")
    );
    if !result.related_tables.is_empty() {
        println!("   Related: {}", result.related_tables.join(", "));
    }
}

async fn report_embedder(config: &Config) -> Result<()> {
    match config.embedding.provider {
        EmbeddingProvider::Hashing => {
            println!(
                "Embedder: hashing ({} dimensions, offline)",
                config.embedding.dimension
            );
        }
        EmbeddingProvider::Ollama => {
            let embedder = OllamaEmbedder::new(config)?;
            let health = tokio::task::spawn_blocking(move || embedder.health_check())
                .await
                .context("Health check task failed")?;
            match health {
                Ok(()) => println!(
                    "Embedder: Ollama at {}:{} with model {}",
                    config.ollama.host, config.ollama.port, config.embedding.model
                ),
                Err(e) => println!("Embedder: Ollama unavailable - {}", e),
            }
        }
    }
    Ok(())
}

/// Describe the embedder and the cached index
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    report_embedder(config).await?;

    let cache = CacheStore::open(config.cache_path()).await?;
    let Some(meta) = cache.meta().await? else {
        println!("No index cached at {}", cache.path().display());
        println!("Use 'schema-search index <database>' to build one.");
        return Ok(());
    };

    println!("Index cache: {}", cache.path().display());
    println!("  Database: {}", meta.database);
    println!("  Tables: {}", meta.table_count);
    println!("  Chunks: {}", meta.chunk_count);
    println!(
        "  Embedding model: {} ({}, {} dimensions)",
        meta.embedding_model, meta.metric, meta.dimension
    );
    println!("  Chunking: {}", meta.chunking_strategy);
    println!("  Built at: {}", meta.built_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Fingerprint: {}", meta.fingerprint);
    Ok(())
}

/// Delete the cached index
#[inline]
pub async fn clear_cache(config: &Config) -> Result<()> {
    let cache = CacheStore::open(config.cache_path()).await?;
    cache.clear().await?;
    println!("Cleared {}", cache.path().display());
    Ok(())
}

/// Show the configuration, or apply and save overrides
#[inline]
pub fn configure(mut config: Config, update: ConfigUpdate) -> Result<()> {
    if !update.is_empty() {
        update.apply(&mut config)?;
        config.save()?;
        println!("Saved {}", config.config_file_path().display());
    }
    print!("{}", describe_config(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_update_validates_values() {
        let mut config = Config::default();
        let update = ConfigUpdate {
            ollama_port: Some(0),
            ..ConfigUpdate::default()
        };
        assert!(update.apply(&mut config).is_err());
        assert_eq!(config.ollama.port, 11434);

        let update = ConfigUpdate {
            ollama_host: Some("ollama.internal".to_string()),
            batch_size: Some(8),
            ..ConfigUpdate::default()
        };
        assert!(!update.is_empty());
        update.apply(&mut config).expect("valid update should apply");
        assert_eq!(config.ollama.host, "ollama.internal");
        assert_eq!(config.embedding.batch_size, 8);
    }

    #[test]
    fn configure_saves_overrides() {
        let dir = TempDir::new().expect("temp dir should be created");
        let config = Config {
            base_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let update = ConfigUpdate {
            embedding_model: Some("mxbai-embed-large".to_string()),
            ..ConfigUpdate::default()
        };
        configure(config, update).expect("configure should succeed");

        let reloaded = Config::load(dir.path()).expect("saved config should load");
        assert_eq!(reloaded.embedding.model, "mxbai-embed-large");
    }

    #[tokio::test]
    async fn status_of_empty_cache() {
        let dir = TempDir::new().expect("temp dir should be created");
        let mut config = Config {
            base_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.embedding.provider = EmbeddingProvider::Hashing;
        show_status(&config).await.expect("status should succeed");
        clear_cache(&config).await.expect("clear should succeed");
    }
}
