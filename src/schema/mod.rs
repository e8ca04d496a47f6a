
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteExtractor;

/// A single column of a table, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Extra constraints such as `UNIQUE` or `CHECK (...)`
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// A foreign key from local columns to another table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub constrained_columns: Vec<String>,
    /// Identifier of the referenced table (`schema.name` when qualified)
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Immutable snapshot of one table's structural metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub indices: Vec<IndexInfo>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Table {
    #[inline]
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indices: Vec::new(),
            comment: None,
        }
    }

    /// Schema-qualified identifier, unique within one database
    #[inline]
    pub fn id(&self) -> String {
        qualify(self.schema.as_deref(), &self.name)
    }

    #[inline]
    pub fn with_column(mut self, name: &str, data_type: &str, nullable: bool) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default: None,
            constraints: Vec::new(),
        });
        self
    }

    #[inline]
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    #[inline]
    pub fn with_foreign_key(
        mut self,
        constrained_columns: &[&str],
        referred_table: &str,
        referred_columns: &[&str],
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            constrained_columns: constrained_columns.iter().map(|c| (*c).to_string()).collect(),
            referred_table: referred_table.to_string(),
            referred_columns: referred_columns.iter().map(|c| (*c).to_string()).collect(),
        });
        self
    }

    #[inline]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    #[inline]
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }
}

#[inline]
pub fn qualify(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{}.{}", schema, name),
        _ => name.to_string(),
    }
}

/// Source of table metadata for one database
#[async_trait]
pub trait SchemaExtractor: Send + Sync {
    /// Stable identity of the database, folded into the cache fingerprint
    fn identity(&self) -> String;

    async fn extract(&self) -> Result<Vec<Table>>;
}

/// Extractor over an already materialized list of tables
#[derive(Debug, Clone)]
pub struct StaticExtractor {
    identity: String,
    tables: Vec<Table>,
}

impl StaticExtractor {
    #[inline]
    pub fn new(identity: &str, tables: Vec<Table>) -> Self {
        Self {
            identity: identity.to_string(),
            tables,
        }
    }
}

#[async_trait]
impl SchemaExtractor for StaticExtractor {
    #[inline]
    fn identity(&self) -> String {
        self.identity.clone()
    }

    #[inline]
    async fn extract(&self) -> Result<Vec<Table>> {
        Ok(self.tables.clone())
    }
}
