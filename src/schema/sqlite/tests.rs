use super::*;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn create_shop_database(dir: &TempDir) -> Result<PathBuf> {
    let path = dir.path().join("shop.db");
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, name TEXT)",
        "CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            placed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE TABLE order_items (
            order_id INTEGER NOT NULL,
            line INTEGER NOT NULL,
            sku TEXT,
            PRIMARY KEY (order_id, line),
            FOREIGN KEY (order_id) REFERENCES orders
        )",
        "CREATE INDEX idx_orders_placed_at ON orders(placed_at)",
    ] {
        sqlx::query(statement).execute(&pool).await?;
    }
    pool.close().await;
    Ok(path)
}

#[tokio::test]
async fn extracts_columns_keys_and_indices() -> Result<()> {
    let dir = TempDir::new()?;
    let path = create_shop_database(&dir).await?;

    let extractor = SqliteExtractor::open(&path).await?;
    let tables = extractor.extract().await?;

    let ids: Vec<String> = tables.iter().map(Table::id).collect();
    assert_eq!(ids, vec!["main.customers", "main.order_items", "main.orders"]);

    let orders = &tables[2];
    assert_eq!(orders.primary_key, vec!["id"]);
    assert_eq!(orders.columns.len(), 3);
    assert!(!orders.columns[1].nullable);
    assert_eq!(
        orders.columns[2].default.as_deref(),
        Some("CURRENT_TIMESTAMP")
    );
    assert_eq!(orders.foreign_keys.len(), 1);
    assert_eq!(orders.foreign_keys[0].referred_table, "main.customers");
    assert_eq!(orders.foreign_keys[0].referred_columns, vec!["id"]);
    assert!(orders.indices.iter().any(|i| i.name == "idx_orders_placed_at"));

    let customers = &tables[0];
    let email = customers
        .columns
        .iter()
        .find(|c| c.name == "email")
        .expect("email column should exist");
    assert!(email.constraints.iter().any(|c| c == "UNIQUE"));

    Ok(())
}

#[tokio::test]
async fn implicit_reference_resolves_to_primary_key() -> Result<()> {
    let dir = TempDir::new()?;
    let path = create_shop_database(&dir).await?;

    let tables = SqliteExtractor::open(&path).await?.extract().await?;
    let items = &tables[1];
    assert_eq!(items.primary_key, vec!["order_id", "line"]);
    assert_eq!(items.foreign_keys[0].referred_table, "main.orders");
    assert_eq!(items.foreign_keys[0].referred_columns, vec!["id"]);

    Ok(())
}

#[tokio::test]
async fn missing_database_is_an_error() {
    let dir = TempDir::new().expect("tempdir should be created");
    let result = SqliteExtractor::open(dir.path().join("absent.db")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn identity_names_the_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = create_shop_database(&dir).await?;
    let extractor = SqliteExtractor::open(&path).await?;
    assert!(extractor.identity().starts_with("sqlite:"));
    assert!(extractor.identity().ends_with("shop.db"));
    Ok(())
}
