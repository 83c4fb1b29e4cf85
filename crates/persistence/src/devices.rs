//! SQL device and verification-code stores

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use edgevoice_registry::{
    AuthStatus, CodeStore, Device, DeviceStore, RegistryError, VerificationCode, WifiInfo,
};

use crate::PersistenceError;

fn storage_err(err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Storage(err.to_string())
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn auth_status_to_str(status: AuthStatus) -> &'static str {
    match status {
        AuthStatus::Pending => "pending",
        AuthStatus::Approved => "approved",
        AuthStatus::Rejected => "rejected",
    }
}

fn auth_status_from_str(s: &str) -> AuthStatus {
    match s {
        "approved" => AuthStatus::Approved,
        "rejected" => AuthStatus::Rejected,
        _ => AuthStatus::Pending,
    }
}

fn row_to_device(row: &sqlx::sqlite::SqliteRow) -> Result<Device, RegistryError> {
    let wifi_json: String = row.try_get("wifi").map_err(storage_err)?;
    let wifi: WifiInfo = serde_json::from_str(&wifi_json).unwrap_or_default();
    let status: String = row.try_get("auth_status").map_err(storage_err)?;

    Ok(Device {
        id: row.try_get("id").map_err(storage_err)?,
        device_id: row.try_get("device_id").map_err(storage_err)?,
        client_id: row.try_get("client_id").map_err(storage_err)?,
        user_id: row.try_get("user_id").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        firmware_version: row.try_get("firmware_version").map_err(storage_err)?,
        board_type: row.try_get("board_type").map_err(storage_err)?,
        chip_model: row.try_get("chip_model").map_err(storage_err)?,
        wifi,
        auth_status: auth_status_from_str(&status),
        auth_code: row.try_get("auth_code").map_err(storage_err)?,
        register_time: millis_to_datetime(row.try_get("register_time").map_err(storage_err)?),
        last_active_time: millis_to_datetime(
            row.try_get("last_active_time").map_err(storage_err)?,
        ),
        last_ip: row.try_get("last_ip").map_err(storage_err)?,
        total_tokens: row.try_get::<i64, _>("total_tokens").map_err(storage_err)? as u64,
        used_tokens: row.try_get::<i64, _>("used_tokens").map_err(storage_err)? as u64,
        last_session_end_at: row
            .try_get::<Option<i64>, _>("last_session_end_at")
            .map_err(storage_err)?
            .map(millis_to_datetime),
        conversation_id: row.try_get("conversation_id").map_err(storage_err)?,
        mode: row.try_get("mode").map_err(storage_err)?,
    })
}

/// Upsert a device row. Works against the pool or an open transaction.
async fn upsert_device<'e, E>(executor: E, device: &Device) -> Result<(), RegistryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let wifi = serde_json::to_string(&device.wifi).map_err(storage_err)?;
    sqlx::query(
        "INSERT INTO devices \
         (id, device_id, client_id, user_id, name, firmware_version, board_type, chip_model, \
          wifi, auth_status, auth_code, register_time, last_active_time, last_ip, \
          total_tokens, used_tokens, last_session_end_at, conversation_id, mode) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
         ON CONFLICT(device_id) DO UPDATE SET \
           client_id = excluded.client_id, \
           user_id = excluded.user_id, \
           name = excluded.name, \
           firmware_version = excluded.firmware_version, \
           board_type = excluded.board_type, \
           chip_model = excluded.chip_model, \
           wifi = excluded.wifi, \
           auth_status = excluded.auth_status, \
           auth_code = excluded.auth_code, \
           last_active_time = excluded.last_active_time, \
           last_ip = excluded.last_ip, \
           total_tokens = excluded.total_tokens, \
           used_tokens = excluded.used_tokens, \
           last_session_end_at = excluded.last_session_end_at, \
           conversation_id = excluded.conversation_id, \
           mode = excluded.mode",
    )
    .bind(&device.id)
    .bind(&device.device_id)
    .bind(&device.client_id)
    .bind(&device.user_id)
    .bind(&device.name)
    .bind(&device.firmware_version)
    .bind(&device.board_type)
    .bind(&device.chip_model)
    .bind(wifi)
    .bind(auth_status_to_str(device.auth_status))
    .bind(&device.auth_code)
    .bind(device.register_time.timestamp_millis())
    .bind(device.last_active_time.timestamp_millis())
    .bind(&device.last_ip)
    .bind(device.total_tokens as i64)
    .bind(device.used_tokens as i64)
    .bind(device.last_session_end_at.map(|t| t.timestamp_millis()))
    .bind(&device.conversation_id)
    .bind(&device.mode)
    .execute(executor)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Upsert a verification code row.
async fn upsert_code<'e, E>(executor: E, code: &VerificationCode) -> Result<(), RegistryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO verification_codes \
         (id, code, purpose, device_id, expires_at, is_used, used_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(id) DO UPDATE SET \
           is_used = excluded.is_used, \
           used_at = excluded.used_at",
    )
    .bind(&code.id)
    .bind(&code.code)
    .bind(&code.purpose)
    .bind(&code.device_id)
    .bind(code.expires_at.timestamp_millis())
    .bind(code.used as i64)
    .bind(code.used_at.map(|t| t.timestamp_millis()))
    .bind(code.created_at.timestamp_millis())
    .execute(executor)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Device rows keyed by `device_id`.
#[derive(Clone)]
pub struct SqlDeviceStore {
    pool: SqlitePool,
}

impl SqlDeviceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for SqlDeviceStore {
    async fn save(&self, device: &Device) -> Result<(), RegistryError> {
        upsert_device(&self.pool, device).await
    }

    async fn get(&self, device_id: &str) -> Result<Option<Device>, RegistryError> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = ?1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_device).transpose()
    }

    async fn list(&self) -> Result<Vec<Device>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY register_time")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_device).collect()
    }

    async fn remove(&self, device_id: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM devices WHERE device_id = ?1")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

/// Verification-code rows; activation persists code and device in one
/// transaction.
#[derive(Clone)]
pub struct SqlCodeStore {
    pool: SqlitePool,
}

impl SqlCodeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodeStore for SqlCodeStore {
    async fn save(&self, code: &VerificationCode) -> Result<(), RegistryError> {
        upsert_code(&self.pool, code).await
    }

    async fn find(
        &self,
        code: &str,
        purpose: &str,
    ) -> Result<Option<VerificationCode>, RegistryError> {
        let row =
            sqlx::query("SELECT * FROM verification_codes WHERE code = ?1 AND purpose = ?2")
                .bind(code)
                .bind(purpose)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;

        row.map(|row| {
            Ok(VerificationCode {
                id: row.try_get("id").map_err(storage_err)?,
                code: row.try_get("code").map_err(storage_err)?,
                purpose: row.try_get("purpose").map_err(storage_err)?,
                device_id: row.try_get("device_id").map_err(storage_err)?,
                expires_at: millis_to_datetime(row.try_get("expires_at").map_err(storage_err)?),
                used: row.try_get::<i64, _>("is_used").map_err(storage_err)? != 0,
                used_at: row
                    .try_get::<Option<i64>, _>("used_at")
                    .map_err(storage_err)?
                    .map(millis_to_datetime),
                created_at: millis_to_datetime(row.try_get("created_at").map_err(storage_err)?),
            })
        })
        .transpose()
    }

    async fn persist_activation(
        &self,
        _device_store: &dyn DeviceStore,
        device: &Device,
        code: &VerificationCode,
    ) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        upsert_code(&mut *tx, code).await?;
        upsert_device(&mut *tx, device).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}

/// Convenience pair constructor used by the bootstrap graph.
pub fn sql_stores(pool: SqlitePool) -> (SqlDeviceStore, SqlCodeStore) {
    (SqlDeviceStore::new(pool.clone()), SqlCodeStore::new(pool))
}

impl From<PersistenceError> for RegistryError {
    fn from(err: PersistenceError) -> Self {
        RegistryError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use chrono::Duration;
    use edgevoice_registry::PURPOSE_ACTIVATE_DEVICE;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn stores() -> (SqlDeviceStore, SqlCodeStore) {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        sql_stores(pool)
    }

    #[tokio::test]
    async fn device_roundtrip() {
        let (devices, _) = stores().await;
        let mut device = Device::new("dev-A", "cli-1", "kitchen", "1.0.0", "1.2.3.4");
        device.wifi.ssid = "lab".to_string();
        devices.save(&device).await.unwrap();

        let got = devices.get("dev-A").await.unwrap().unwrap();
        assert_eq!(got.id, device.id);
        assert_eq!(got.wifi.ssid, "lab");
        assert_eq!(got.auth_status, AuthStatus::Pending);
        assert_eq!(
            got.register_time.timestamp_millis(),
            device.register_time.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn re_register_keeps_single_row() {
        let (devices, _) = stores().await;
        let mut device = Device::new("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4");
        devices.save(&device).await.unwrap();

        device.touch("5.6.7.8");
        devices.save(&device).await.unwrap();

        let all = devices.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_ip, "5.6.7.8");
    }

    #[tokio::test]
    async fn activation_persists_both_rows() {
        let (devices, codes) = stores().await;
        let mut device = Device::new("dev-A", "cli-1", "n", "1.0.0", "1.2.3.4");
        let mut code =
            VerificationCode::generate("dev-A", PURPOSE_ACTIVATE_DEVICE, Duration::hours(24));
        device.auth_code = code.code.clone();
        devices.save(&device).await.unwrap();
        codes.save(&code).await.unwrap();

        code.consume("dev-A").unwrap();
        device.approve("admin").unwrap();
        codes
            .persist_activation(&devices, &device, &code)
            .await
            .unwrap();

        let got = devices.get("dev-A").await.unwrap().unwrap();
        assert_eq!(got.auth_status, AuthStatus::Approved);
        assert_eq!(got.auth_code, "");

        let got_code = codes
            .find(&code.code, PURPOSE_ACTIVATE_DEVICE)
            .await
            .unwrap()
            .unwrap();
        assert!(got_code.used);
        assert!(got_code.used_at.is_some());
    }
}
