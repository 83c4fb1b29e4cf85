//! Vision upload
//!
//! Multipart image validated against the configured policy: byte budget,
//! pixel budget, dimension caps, format allow-list, optional full decode.
//! Oversize yields 413, unsupported format 415.

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use image::ImageFormat;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;

use edgevoice_config::VisionConfig;

use crate::http::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VisionQuery {
    /// Session to attach the validated image to
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn vision_upload(
    State(state): State<AppState>,
    Query(query): Query<VisionQuery>,
    multipart: Multipart,
) -> Response {
    let policy = state.settings.read().vision.clone();
    let budget = Duration::from_secs(policy.timeout_secs);

    match tokio::time::timeout(budget, handle_upload(&state, &policy, query, multipart)).await {
        Ok(response) => response,
        Err(_) => ApiError::response(StatusCode::REQUEST_TIMEOUT, "vision processing timed out"),
    }
}

async fn handle_upload(
    state: &AppState,
    policy: &VisionConfig,
    query: VisionQuery,
    mut multipart: Multipart,
) -> Response {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default();
                if name == "image" || name == "file" {
                    break field;
                }
            }
            Ok(None) => {
                return ApiError::response(StatusCode::BAD_REQUEST, "missing image field")
            }
            Err(e) => {
                return ApiError::response(
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart body: {e}"),
                )
            }
        }
    };

    let bytes = match field.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ApiError::response(
                StatusCode::BAD_REQUEST,
                format!("failed reading upload: {e}"),
            )
        }
    };

    if bytes.len() as u64 > policy.max_bytes {
        return ApiError::response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("image exceeds {} bytes", policy.max_bytes),
        );
    }

    let format = match image::guess_format(&bytes) {
        Ok(format) => format,
        Err(_) => {
            return ApiError::response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unrecognized image format",
            )
        }
    };
    let format_name = format_label(format);
    if !policy.formats.iter().any(|f| f == format_name) {
        return ApiError::response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("format '{format_name}' not allowed"),
        );
    }

    let (width, height) = if policy.deep_scan {
        // Full decode catches dimension lies and truncated payloads.
        match image::load_from_memory(&bytes) {
            Ok(img) => (img.width(), img.height()),
            Err(e) => {
                return ApiError::response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    format!("image decode failed: {e}"),
                )
            }
        }
    } else {
        let reader = image::ImageReader::new(Cursor::new(bytes.as_ref()))
            .with_guessed_format()
            .expect("cursor io is infallible");
        match reader.into_dimensions() {
            Ok(dims) => dims,
            Err(e) => {
                return ApiError::response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    format!("image header unreadable: {e}"),
                )
            }
        }
    };

    if width > policy.max_width || height > policy.max_height {
        return ApiError::response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "dimensions {width}x{height} exceed {}x{}",
                policy.max_width, policy.max_height
            ),
        );
    }
    if (width as u64) * (height as u64) > policy.max_pixels {
        return ApiError::response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("pixel count exceeds {}", policy.max_pixels),
        );
    }

    // Attach to the live conversation, if one was named.
    if let Some(session_id) = &query.session_id {
        match state.sessions.get(session_id) {
            Some(session) => session.attach_vision_frame(bytes.to_vec()),
            None => {
                return ApiError::response(StatusCode::NOT_FOUND, "session not found");
            }
        }
    }

    Json(serde_json::json!({
        "success": true,
        "message": "image accepted",
        "data": {
            "format": format_name,
            "width": width,
            "height": height,
            "bytes": bytes.len(),
        }
    }))
    .into_response()
}

fn format_label(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "other",
    }
}
