use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchemaSearchError>;

#[derive(Error, Debug)]
pub enum SchemaSearchError {
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Chunking error for table {table}: {message}")]
    Chunking { table: String, message: String },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Index has not been built; run index() first")]
    NotIndexed,

    #[error("Unknown search strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error("Rerank error: {0}")]
    Rerank(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SchemaSearchError {
    #[inline]
    pub fn invalid_parameter(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}

pub mod cache;
pub mod chunking;
pub mod commands;
pub mod config;
pub mod embeddings;
pub mod graph;
pub mod rerank;
pub mod schema;
pub mod scoring;
pub mod search;
mod text;

pub use search::{
    IndexMode, IndexSnapshot, IndexStats, IndexStatus, SchemaSearch, SearchOutcome, SearchRequest,
    SearchResult,
};
