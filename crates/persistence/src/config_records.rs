//! Config record store
//!
//! Versioned JSON values keyed by name. Saving an existing key bumps its
//! version; loading returns the active value.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::PersistenceError;

#[derive(Clone)]
pub struct ConfigRecordStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct ConfigRecord {
    pub key: String,
    pub value: Value,
    pub category: String,
    pub version: i64,
    pub is_active: bool,
}

impl ConfigRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        key: &str,
        value: &Value,
        category: &str,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(value)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO config_records (key, value, category, version, is_active) \
             VALUES (?1, ?2, ?3, 1, 1) \
             ON CONFLICT(key) DO UPDATE SET \
               value = excluded.value, \
               category = excluded.category, \
               version = config_records.version + 1, \
               is_active = 1",
        )
        .bind(key)
        .bind(json)
        .bind(category)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Option<ConfigRecord>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM config_records WHERE key = ?1 AND is_active = 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let raw: String = row.try_get("value")?;
            let value = serde_json::from_str(&raw)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
            Ok(ConfigRecord {
                key: row.try_get("key")?,
                value,
                category: row.try_get("category")?,
                version: row.try_get("version")?,
                is_active: row.try_get::<i64, _>("is_active")? != 0,
            })
        })
        .transpose()
    }

    pub async fn deactivate(&self, key: &str) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE config_records SET is_active = 0 WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn store() -> ConfigRecordStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        ConfigRecordStore::new(pool)
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = store().await;
        let value = json!({"selected": "volcano", "retries": 2});
        store.save("asr", &value, "providers").await.unwrap();

        let record = store.load("asr").await.unwrap().unwrap();
        assert_eq!(record.value, value);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let store = store().await;
        store.save("k", &json!(1), "c").await.unwrap();
        store.save("k", &json!(2), "c").await.unwrap();

        let record = store.load("k").await.unwrap().unwrap();
        assert_eq!(record.value, json!(2));
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn deactivated_records_do_not_load() {
        let store = store().await;
        store.save("k", &json!(1), "c").await.unwrap();
        store.deactivate("k").await.unwrap();
        assert!(store.load("k").await.unwrap().is_none());
    }
}
