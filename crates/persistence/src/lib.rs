//! Embedded SQL persistence layer
//!
//! Provides durable storage for:
//! - Devices and verification codes (the registry's SQL stores)
//! - Config records
//!
//! Schema changes run through the migration runner in [`schema`], tracked in
//! `migration_records`.

pub mod config_records;
pub mod devices;
pub mod schema;

pub use config_records::{ConfigRecord, ConfigRecordStore};
pub use devices::{sql_stores, SqlCodeStore, SqlDeviceStore};
pub use schema::run_migrations;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;

/// Persistence errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Combined persistence layer handed to the bootstrap graph.
pub struct PersistenceLayer {
    pub pool: SqlitePool,
    pub devices: SqlDeviceStore,
    pub codes: SqlCodeStore,
    pub config: ConfigRecordStore,
}

/// Open (creating if missing) the sqlite database and apply migrations.
pub async fn init(path: &str) -> Result<PersistenceLayer, PersistenceError> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let applied = run_migrations(&pool).await?;
    if applied > 0 {
        tracing::info!(applied, path, "database migrations applied");
    }

    let (devices, codes) = sql_stores(pool.clone());
    Ok(PersistenceLayer {
        config: ConfigRecordStore::new(pool.clone()),
        devices,
        codes,
        pool,
    })
}

/// In-memory database for tests and ephemeral deployments.
pub async fn init_in_memory() -> Result<PersistenceLayer, PersistenceError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    let (devices, codes) = sql_stores(pool.clone());
    Ok(PersistenceLayer {
        config: ConfigRecordStore::new(pool.clone()),
        devices,
        codes,
        pool,
    })
}
