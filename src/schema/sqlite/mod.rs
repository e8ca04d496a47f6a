#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Column, ForeignKey, IndexInfo, SchemaExtractor, Table, qualify};

const MAIN_SCHEMA: &str = "main";

/// Introspects a SQLite database file through its `pragma_*` table functions
#[derive(Debug, Clone)]
pub struct SqliteExtractor {
    path: PathBuf,
    pool: SqlitePool,
}

type ColumnRow = (String, String, i64, Option<String>, i64);
type ForeignKeyRow = (i64, i64, String, String, Option<String>);
type IndexRow = (String, i64, String);

impl SqliteExtractor {
    #[inline]
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("SQLite database not found: {}", path.display());
        }

        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Ok(Self { path, pool })
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tables")?;
        Ok(names)
    }

    async fn describe(&self, name: String) -> Result<Table> {
        let column_rows: Vec<ColumnRow> = sqlx::query_as(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )
        .bind(&name)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read columns of {}", name))?;

        let fk_rows: Vec<ForeignKeyRow> = sqlx::query_as(
            r#"SELECT id, seq, "table", "from", "to" FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
        )
        .bind(&name)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read foreign keys of {}", name))?;

        let index_rows: Vec<IndexRow> =
            sqlx::query_as(r#"SELECT name, "unique", origin FROM pragma_index_list(?1)"#)
                .bind(&name)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("Failed to read indices of {}", name))?;

        let mut table = Table::new(Some(MAIN_SCHEMA), &name);

        let mut pk: Vec<(i64, String)> = Vec::new();
        for (column, data_type, not_null, default, pk_position) in column_rows {
            if pk_position > 0 {
                pk.push((pk_position, column.clone()));
            }
            table.columns.push(Column {
                name: column,
                data_type,
                nullable: not_null == 0 && pk_position == 0,
                default,
                constraints: Vec::new(),
            });
        }
        pk.sort();
        table.primary_key = pk.into_iter().map(|(_, column)| column).collect();

        let mut foreign_keys: Vec<(i64, ForeignKey)> = Vec::new();
        for (id, _seq, referred, from, to) in fk_rows {
            let referred_table = qualify(Some(MAIN_SCHEMA), &referred);
            match foreign_keys.last_mut() {
                Some((last_id, fk)) if *last_id == id => {
                    fk.constrained_columns.push(from);
                    fk.referred_columns.extend(to);
                }
                _ => foreign_keys.push((
                    id,
                    ForeignKey {
                        constrained_columns: vec![from],
                        referred_table,
                        referred_columns: to.into_iter().collect(),
                    },
                )),
            }
        }
        table.foreign_keys = foreign_keys.into_iter().map(|(_, fk)| fk).collect();

        for (index_name, unique, origin) in index_rows {
            if origin == "pk" {
                continue;
            }
            let columns: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM pragma_index_info(?1) WHERE name IS NOT NULL ORDER BY seqno",
            )
            .bind(&index_name)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to read index {}", index_name))?;

            if unique != 0 && origin == "u" && columns.len() == 1 {
                if let Some(column) = table.columns.iter_mut().find(|c| c.name == columns[0]) {
                    column.constraints.push("UNIQUE".to_string());
                }
            }
            table.indices.push(IndexInfo {
                name: index_name,
                columns,
                unique: unique != 0,
            });
        }
        table.indices.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            "Described {} ({} columns, {} foreign keys)",
            table.id(),
            table.columns.len(),
            table.foreign_keys.len()
        );
        Ok(table)
    }
}

#[async_trait]
impl SchemaExtractor for SqliteExtractor {
    #[inline]
    fn identity(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    #[inline]
    async fn extract(&self) -> Result<Vec<Table>> {
        let names = self.table_names().await?;
        info!("Extracting {} tables from {}", names.len(), self.path.display());

        let mut tables = try_join_all(names.into_iter().map(|name| self.describe(name))).await?;
        resolve_implicit_references(&mut tables);
        Ok(tables)
    }
}

/// `REFERENCES parent` without a column list points at the parent's primary key
fn resolve_implicit_references(tables: &mut [Table]) {
    let primary_keys: HashMap<String, Vec<String>> = tables
        .iter()
        .map(|t| (t.id(), t.primary_key.clone()))
        .collect();

    for table in tables.iter_mut() {
        for fk in &mut table.foreign_keys {
            if fk.referred_columns.is_empty() {
                if let Some(pk) = primary_keys.get(&fk.referred_table) {
                    fk.referred_columns.clone_from(pk);
                }
            }
        }
    }
}
