//! Sqlite schema migrations
//!
//! Applied migrations are tracked in `migration_records`; each migration runs
//! at most once, inside its own transaction.

use sqlx::{Row, SqlitePool};

use crate::PersistenceError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_auth_clients",
        sql: "CREATE TABLE IF NOT EXISTS auth_clients (
            client_id  TEXT PRIMARY KEY,
            username   TEXT NOT NULL,
            password   TEXT NOT NULL,
            ip         TEXT,
            device_id  TEXT,
            created_at INTEGER NOT NULL,
            expires_at INTEGER,
            metadata   TEXT NOT NULL DEFAULT '{}'
        )",
    },
    Migration {
        version: 2,
        name: "create_devices",
        sql: "CREATE TABLE IF NOT EXISTS devices (
            id                  TEXT PRIMARY KEY,
            device_id           TEXT NOT NULL UNIQUE,
            client_id           TEXT NOT NULL,
            user_id             TEXT,
            name                TEXT NOT NULL DEFAULT '',
            firmware_version    TEXT NOT NULL DEFAULT '',
            board_type          TEXT NOT NULL DEFAULT '',
            chip_model          TEXT NOT NULL DEFAULT '',
            wifi                TEXT NOT NULL DEFAULT '{}',
            auth_status         TEXT NOT NULL DEFAULT 'pending',
            auth_code           TEXT NOT NULL DEFAULT '',
            register_time       INTEGER NOT NULL,
            last_active_time    INTEGER NOT NULL,
            last_ip             TEXT NOT NULL DEFAULT '',
            total_tokens        INTEGER NOT NULL DEFAULT 0,
            used_tokens         INTEGER NOT NULL DEFAULT 0,
            last_session_end_at INTEGER,
            conversation_id     TEXT NOT NULL DEFAULT '',
            mode                TEXT NOT NULL DEFAULT ''
        )",
    },
    Migration {
        version: 3,
        name: "create_verification_codes",
        sql: "CREATE TABLE IF NOT EXISTS verification_codes (
            id         TEXT PRIMARY KEY,
            code       TEXT NOT NULL,
            purpose    TEXT NOT NULL,
            device_id  TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            is_used    INTEGER NOT NULL DEFAULT 0,
            used_at    INTEGER,
            created_at INTEGER NOT NULL
        )",
    },
    Migration {
        version: 4,
        name: "index_verification_codes",
        sql: "CREATE INDEX IF NOT EXISTS idx_verification_codes_code_purpose
              ON verification_codes (code, purpose)",
    },
    Migration {
        version: 5,
        name: "create_config_records",
        sql: "CREATE TABLE IF NOT EXISTS config_records (
            key       TEXT NOT NULL UNIQUE,
            value     TEXT NOT NULL,
            category  TEXT NOT NULL DEFAULT '',
            version   INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
    },
];

const CREATE_MIGRATION_RECORDS: &str = "CREATE TABLE IF NOT EXISTS migration_records (
    version    INTEGER NOT NULL UNIQUE,
    name       TEXT NOT NULL,
    applied_at INTEGER NOT NULL
)";

/// Apply all pending migrations. Returns how many ran.
pub async fn run_migrations(pool: &SqlitePool) -> Result<usize, PersistenceError> {
    sqlx::query(CREATE_MIGRATION_RECORDS).execute(pool).await?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM migration_records")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<i64, _>("version"))
        .collect();

    let mut ran = 0;
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::query(migration.sql).execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO migration_records (version, name, applied_at) VALUES (?1, ?2, ?3)",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(version = migration.version, name = migration.name, "applied migration");
        ran += 1;
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn memory_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        let first = run_migrations(&pool).await.unwrap();
        assert_eq!(first, MIGRATIONS.len());

        let second = run_migrations(&pool).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn migration_records_are_tracked() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }
}
