//! Embedded SQL auth store (sqlite via sqlx)

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use crate::{AuthError, ClientCredential, StoreStats};

use super::AuthStore;

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS auth_clients (
    client_id  TEXT PRIMARY KEY,
    username   TEXT NOT NULL,
    password   TEXT NOT NULL,
    ip         TEXT,
    device_id  TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    metadata   TEXT NOT NULL DEFAULT '{}'
)";

/// Metadata and labels share one JSON column.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetadataBlob {
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// One row per credential; `store` replaces on conflict inside a transaction.
pub struct SqliteAuthStore {
    pool: SqlitePool,
}

impl SqliteAuthStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// table exists.
    pub async fn connect(path: &str) -> Result<Self, AuthError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with the persistence layer).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, AuthError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_credential(row: &sqlx::sqlite::SqliteRow) -> Result<ClientCredential, AuthError> {
        let blob: String = row.try_get("metadata")?;
        let blob: MetadataBlob = serde_json::from_str(&blob).unwrap_or_default();
        let created_ms: i64 = row.try_get("created_at")?;
        let expires_ms: Option<i64> = row.try_get("expires_at")?;

        Ok(ClientCredential {
            client_id: row.try_get("client_id")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            ip: row.try_get("ip")?,
            device_id: row.try_get("device_id")?,
            created_at: millis_to_datetime(created_ms),
            expires_at: expires_ms.map(millis_to_datetime),
            metadata: blob.metadata,
            labels: blob.labels,
        })
    }

    async fn fetch(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        let row = sqlx::query("SELECT * FROM auth_clients WHERE client_id = ?1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_credential).transpose()
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn store(&self, info: ClientCredential) -> Result<(), AuthError> {
        let blob = serde_json::to_string(&MetadataBlob {
            metadata: info.metadata.clone(),
            labels: info.labels.clone(),
        })
        .map_err(|e| AuthError::Storage(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM auth_clients WHERE client_id = ?1")
            .bind(&info.client_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO auth_clients \
             (client_id, username, password, ip, device_id, created_at, expires_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&info.client_id)
        .bind(&info.username)
        .bind(&info.password)
        .bind(&info.ip)
        .bind(&info.device_id)
        .bind(info.created_at.timestamp_millis())
        .bind(info.expires_at.map(|t| t.timestamp_millis()))
        .bind(blob)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn validate(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(Option<ClientCredential>, bool), AuthError> {
        let Some(cred) = self.fetch(client_id).await? else {
            return Ok((None, false));
        };
        if cred.is_expired() {
            return Err(AuthError::Expired(client_id.to_string()));
        }
        if cred.matches(username, password) {
            Ok((Some(cred), true))
        } else {
            Ok((None, false))
        }
    }

    async fn get(&self, client_id: &str) -> Result<Option<ClientCredential>, AuthError> {
        match self.fetch(client_id).await? {
            None => Ok(None),
            Some(cred) if cred.is_expired() => Err(AuthError::Expired(client_id.to_string())),
            Some(cred) => Ok(Some(cred)),
        }
    }

    async fn remove(&self, client_id: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_clients WHERE client_id = ?1")
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientCredential>, AuthError> {
        let now = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            "SELECT * FROM auth_clients WHERE expires_at IS NULL OR expires_at > ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_credential).collect()
    }

    async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("DELETE FROM auth_clients WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<StoreStats, AuthError> {
        let now = Utc::now().timestamp_millis();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_clients")
            .fetch_one(&self.pool)
            .await?;
        let expired: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM auth_clients WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            driver: "sqlite".to_string(),
            total: total as usize,
            active: (total - expired) as usize,
            expired: expired as usize,
        })
    }

    async fn close(&self) -> Result<(), AuthError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn temp_store() -> (tempfile::TempDir, SqliteAuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        let store = SqliteAuthStore::connect(path.to_str().unwrap())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_validate_roundtrip() {
        let (_dir, store) = temp_store().await;
        let mut cred = ClientCredential::new("c1", "user", "pass");
        cred.metadata.insert("fw".into(), "1.0.0".into());
        cred.labels.insert("fleet".into(), "beta".into());
        store.store(cred).await.unwrap();

        let (got, ok) = store.validate("c1", "user", "pass").await.unwrap();
        assert!(ok);
        let got = got.unwrap();
        assert_eq!(got.metadata.get("fw").unwrap(), "1.0.0");
        assert_eq!(got.labels.get("fleet").unwrap(), "beta");
    }

    #[tokio::test]
    async fn replace_on_conflict() {
        let (_dir, store) = temp_store().await;
        store
            .store(ClientCredential::new("c1", "user", "old"))
            .await
            .unwrap();
        store
            .store(ClientCredential::new("c1", "user", "new"))
            .await
            .unwrap();

        let (_, ok) = store.validate("c1", "user", "new").await.unwrap();
        assert!(ok);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_expired() {
        let (_dir, store) = temp_store().await;
        let mut dead = ClientCredential::new("dead", "u", "p");
        dead.expires_at = Some(Utc::now() - Duration::seconds(5));
        store.store(dead).await.unwrap();
        store
            .store(ClientCredential::new("live", "u", "p"))
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].client_id, "live");
    }

    #[tokio::test]
    async fn expired_read_errors() {
        let (_dir, store) = temp_store().await;
        let mut cred = ClientCredential::new("c1", "u", "p");
        cred.expires_at = Some(Utc::now() - Duration::seconds(5));
        store.store(cred).await.unwrap();

        assert!(matches!(store.get("c1").await, Err(AuthError::Expired(_))));
        assert!(store.list().await.unwrap().is_empty());
    }
}
