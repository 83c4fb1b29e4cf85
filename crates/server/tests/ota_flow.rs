//! Control-plane integration tests: registration, activation, snapshots and
//! the firmware traversal guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use edgevoice_auth::store::MemoryAuthStore;
use edgevoice_auth::{AuthManager, AuthManagerConfig};
use edgevoice_config::Settings;
use edgevoice_core::{EventBus, ToolExecutor};
use edgevoice_llm::ToolRegistry;
use edgevoice_registry::{DeviceRegistry, DeviceRegistryConfig, MemoryCodeStore, MemoryDeviceStore};
use edgevoice_server::state::ProviderSet;
use edgevoice_server::{create_router, AppState, SessionManager};

fn test_state(require_activation: bool, ota_dir: &str) -> AppState {
    let mut settings = Settings::default();
    settings.device.require_activation_code = require_activation;
    settings.server.ota_bin_dir = ota_dir.to_string();

    let auth = AuthManager::new(
        Arc::new(MemoryAuthStore::new()),
        AuthManagerConfig {
            session_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
            key_ttl_secs: 3600,
        },
    );

    let device_registry = Arc::new(DeviceRegistry::new(
        Arc::new(MemoryDeviceStore::new()),
        Arc::new(MemoryCodeStore::new()),
        DeviceRegistryConfig {
            require_activation_code: require_activation,
            ..Default::default()
        },
    ));

    let providers = ProviderSet::build(&settings);
    let tools: Arc<dyn ToolExecutor> = Arc::new(ToolRegistry::new());

    AppState {
        settings: Arc::new(parking_lot::RwLock::new(settings)),
        bus: Arc::new(EventBus::new()),
        auth,
        device_registry,
        providers,
        sessions: Arc::new(SessionManager::new(16)),
        tools,
    }
}

async fn json_request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

fn register_body() -> serde_json::Value {
    serde_json::json!({
        "deviceId": "dev-A",
        "clientId": "cli-1",
        "name": "n",
        "version": "1.0.0",
        "ipAddress": "1.2.3.4",
        "appInfo": ""
    })
}

#[tokio::test]
async fn activation_happy_path() {
    let app = create_router(test_state(true, "data/ota_bin"));

    let (status, body) =
        json_request(&app, "POST", "/api/ota/register", Some(register_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["deviceId"], "dev-A");
    assert_eq!(body["clientId"], "cli-1");
    assert_eq!(body["requiresAuth"], true);
    let auth_code = body["authCode"].as_str().unwrap().to_string();
    assert_eq!(auth_code.len(), 6);
    assert!(auth_code.chars().all(|c| c.is_ascii_digit()));

    let activate = serde_json::json!({"deviceId": "dev-A", "authCode": auth_code});
    let (status, body) =
        json_request(&app, "POST", "/api/ota/activate", Some(activate.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["deviceId"], "dev-A");

    // The code is one-shot.
    let (status, body) = json_request(&app, "POST", "/api/ota/activate", Some(activate)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "verification code expired or used");
}

#[tokio::test]
async fn auto_approve_path() {
    let app = create_router(test_state(false, "data/ota_bin"));

    let (status, body) =
        json_request(&app, "POST", "/api/ota/register", Some(register_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["requiresAuth"], false);
    assert!(body.get("authCode").is_none());

    let (status, body) = json_request(&app, "GET", "/api/ota/device/dev-A", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authStatus"], "approved");
    assert_eq!(body["authCode"], "");
    assert!(body["userId"].as_str().is_some());
}

#[tokio::test]
async fn unknown_device_activation_is_404() {
    let app = create_router(test_state(true, "data/ota_bin"));
    let activate = serde_json::json!({"deviceId": "ghost", "authCode": "000000"});
    let (status, body) = json_request(&app, "POST", "/api/ota/activate", Some(activate)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn re_register_keeps_one_device_and_updates_liveness() {
    let app = create_router(test_state(true, "data/ota_bin"));

    json_request(&app, "POST", "/api/ota/register", Some(register_body())).await;
    let mut second = register_body();
    second["ipAddress"] = serde_json::json!("5.6.7.8");
    let (status, body) = json_request(&app, "POST", "/api/ota/register", Some(second)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, snapshot) = json_request(&app, "GET", "/api/ota/device/dev-A", None).await;
    assert_eq!(snapshot["lastIp"], "5.6.7.8");
}

#[tokio::test]
async fn firmware_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fw.bin"), b"firmware-bytes").unwrap();
    let app = create_router(test_state(true, dir.path().to_str().unwrap()));

    // Encoded "../etc/passwd" under the firmware root.
    let (status, _) = json_request(&app, "GET", "/ota_bin/..%2Fetc%2Fpasswd", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/ota_bin/fw.bin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"firmware-bytes");

    let (status, _) = json_request(&app, "GET", "/ota_bin/missing.bin", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = create_router(test_state(true, "data/ota_bin"));
    let (status, body) = json_request(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn session_keys_roundtrip_through_auth_manager() {
    let state = test_state(true, "data/ota_bin");
    let keys = state.auth.generate_session_keys("sess-1").unwrap();
    assert_eq!(keys.sym_key.len(), 32);

    let again = state.auth.get_session_keys("sess-1").unwrap();
    assert_eq!(again.sym_key, keys.sym_key);
    assert_eq!(again.nonce, keys.nonce);

    state.auth.revoke_session_keys("sess-1");
    assert!(state.auth.get_session_keys("sess-1").is_err());
    let _ = state.auth.close().await;
}

#[tokio::test]
async fn register_validation_flow_for_client_credentials() {
    let state = test_state(true, "data/ota_bin");
    state
        .auth
        .register_client(
            "cli-1",
            "device",
            "secret",
            Some("1.2.3.4".into()),
            Some("dev-A".into()),
            HashMap::new(),
        )
        .await
        .unwrap();

    let (cred, ok) = state
        .auth
        .validate_client("cli-1", "device", "secret")
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(cred.unwrap().device_id.as_deref(), Some("dev-A"));

    let (_, ok) = state
        .auth
        .validate_client("cli-1", "device", "wrong")
        .await
        .unwrap();
    assert!(!ok);
    let _ = state.auth.close().await;
}
