//! HTTP control plane
//!
//! OTA registration and activation, device snapshots, firmware download with
//! a path-traversal guard, vision upload, health and metrics.

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use edgevoice_registry::{AuthStatus, Device, RegistryError};

use crate::metrics::init_metrics;
use crate::state::AppState;
use crate::vision::vision_upload;
use crate::websocket::ws_handler;

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/ota/register", post(ota_register))
        .route("/api/ota/activate", post(ota_activate))
        .route("/api/ota/device/:device_id", get(ota_device_snapshot))
        .route("/ota_bin/*path", get(firmware_download))
        .route("/api/vision/upload", post(vision_upload))
        .route("/api/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Uniform failure envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub message: String,
}

impl ApiError {
    pub fn response(status: StatusCode, message: impl Into<String>) -> Response {
        (
            status,
            Json(ApiError {
                success: false,
                message: message.into(),
            }),
        )
            .into_response()
    }
}

fn registry_error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    ApiError::response(status, err.to_string())
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count(),
    }))
}

async fn metrics_endpoint() -> impl IntoResponse {
    init_metrics().render()
}

// OTA

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtaRegisterRequest {
    device_id: String,
    client_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    ip_address: String,
    #[serde(default)]
    app_info: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtaRegisterResponse {
    success: bool,
    device_id: String,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_code: Option<String>,
    requires_auth: bool,
}

async fn ota_register(
    State(state): State<AppState>,
    Json(request): Json<OtaRegisterRequest>,
) -> Response {
    let outcome = state
        .device_registry
        .register_device(
            &request.device_id,
            &request.client_id,
            &request.name,
            &request.version,
            &request.ip_address,
            &request.app_info,
        )
        .await;

    match outcome {
        Ok(outcome) => {
            let requires_auth = !outcome.device.is_approved();
            let auth_code = if outcome.device.auth_code.is_empty() {
                None
            } else {
                Some(outcome.device.auth_code.clone())
            };
            Json(OtaRegisterResponse {
                success: true,
                device_id: outcome.device.device_id,
                client_id: outcome.device.client_id,
                auth_code,
                requires_auth,
            })
            .into_response()
        }
        Err(err) => registry_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtaActivateRequest {
    device_id: String,
    auth_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtaActivateResponse {
    success: bool,
    device_id: String,
}

async fn ota_activate(
    State(state): State<AppState>,
    Json(request): Json<OtaActivateRequest>,
) -> Response {
    match state
        .device_registry
        .activate_device(&request.device_id, &request.auth_code)
        .await
    {
        Ok(device) => Json(OtaActivateResponse {
            success: true,
            device_id: device.device_id,
        })
        .into_response(),
        Err(err) => registry_error_response(err),
    }
}

/// Full device snapshot, camel-cased for the control-plane clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceSnapshot {
    id: String,
    device_id: String,
    client_id: String,
    user_id: Option<String>,
    name: String,
    firmware_version: String,
    board_type: String,
    chip_model: String,
    wifi: WifiSnapshot,
    auth_status: AuthStatus,
    auth_code: String,
    register_time: chrono::DateTime<chrono::Utc>,
    last_active_time: chrono::DateTime<chrono::Utc>,
    last_ip: String,
    total_tokens: u64,
    used_tokens: u64,
    last_session_end_at: Option<chrono::DateTime<chrono::Utc>>,
    conversation_id: String,
    mode: String,
}

#[derive(Debug, Serialize)]
struct WifiSnapshot {
    ssid: String,
    channel: u32,
    rssi: i32,
    ip: String,
}

impl From<Device> for DeviceSnapshot {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            device_id: d.device_id,
            client_id: d.client_id,
            user_id: d.user_id,
            name: d.name,
            firmware_version: d.firmware_version,
            board_type: d.board_type,
            chip_model: d.chip_model,
            wifi: WifiSnapshot {
                ssid: d.wifi.ssid,
                channel: d.wifi.channel,
                rssi: d.wifi.rssi,
                ip: d.wifi.ip,
            },
            auth_status: d.auth_status,
            auth_code: d.auth_code,
            register_time: d.register_time,
            last_active_time: d.last_active_time,
            last_ip: d.last_ip,
            total_tokens: d.total_tokens,
            used_tokens: d.used_tokens,
            last_session_end_at: d.last_session_end_at,
            conversation_id: d.conversation_id,
            mode: d.mode,
        }
    }
}

async fn ota_device_snapshot(
    State(state): State<AppState>,
    UrlPath(device_id): UrlPath<String>,
) -> Response {
    match state.device_registry.get_device(&device_id).await {
        Ok(Some(device)) => Json(DeviceSnapshot::from(device)).into_response(),
        Ok(None) => ApiError::response(StatusCode::NOT_FOUND, "device not found"),
        Err(err) => registry_error_response(err),
    }
}

// Firmware download

/// Reject anything that could escape the firmware root.
fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let rel = Path::new(path);
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            // ParentDir, RootDir, Prefix: traversal attempt.
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

async fn firmware_download(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    let root = state.settings.read().server.ota_bin_dir.clone();

    let Some(relative) = sanitize_relative(&path) else {
        return ApiError::response(StatusCode::BAD_REQUEST, "invalid firmware path");
    };
    let full = Path::new(&root).join(relative);

    match tokio::fs::read(&full).await {
        Ok(bytes) => (
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ApiError::response(StatusCode::NOT_FOUND, "firmware not found")
        }
        Err(e) => {
            tracing::error!(path = %full.display(), error = %e, "firmware read failed");
            ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, "firmware read failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_relative("../etc/passwd").is_none());
        assert!(sanitize_relative("a/../../etc/passwd").is_none());
        assert!(sanitize_relative("/etc/passwd").is_none());
        assert!(sanitize_relative("").is_none());
    }

    #[test]
    fn sanitize_accepts_nested_files() {
        assert_eq!(
            sanitize_relative("esp32/fw-1.0.0.bin").unwrap(),
            PathBuf::from("esp32/fw-1.0.0.bin")
        );
        assert_eq!(
            sanitize_relative("./esp32/fw.bin").unwrap(),
            PathBuf::from("esp32/fw.bin")
        );
    }
}
