//! HTTP front door: the WebSocket upgrade plus the upload side-channel.

use crate::assets::{AssetError, AssetStore};
use crate::network::NetworkHandle;
use crate::socket::serve;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::packets::MAX_FRAME_SIZE;
use shared::ConnectParams;
use std::sync::Arc;

/// Slack on top of the asset limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub network: NetworkHandle,
    pub assets: Arc<AssetStore>,
}

#[derive(Debug, Deserialize)]
pub struct UploadCheck {
    pub filename: String,
}

type HttpError = (StatusCode, String);

pub fn router(state: AppState) -> Router {
    let body_limit = state.assets.max_size() as usize + MULTIPART_OVERHEAD;
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .route("/upload-check", get(upload_check_handler))
        .route("/upload", post(upload_handler))
        .route("/assets/:filename", get(asset_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE as usize)
        .on_upgrade(move |socket| serve(socket, params, state.network))
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn upload_check_handler(
    State(state): State<AppState>,
    Query(check): Query<UploadCheck>,
) -> Result<Json<Value>, HttpError> {
    let exists = state
        .assets
        .exists(&check.filename)
        .await
        .map_err(asset_error)?;
    Ok(Json(json!({ "exists": exists })))
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, HttpError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "file field has no filename".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (e.status(), e.body_text()))?;
        let stored = state
            .assets
            .put(&filename, &bytes)
            .await
            .map_err(asset_error)?;
        return Ok(Json(json!({ "filename": filename, "stored": stored })));
    }
    Err((StatusCode::BAD_REQUEST, "missing file field".to_string()))
}

async fn asset_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Vec<u8>, HttpError> {
    match state.assets.read(&filename).await {
        Ok(bytes) => Ok(bytes),
        Err(AssetError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err((StatusCode::NOT_FOUND, format!("{} not found", filename)))
        }
        Err(e) => Err(asset_error(e)),
    }
}

fn asset_error(e: AssetError) -> HttpError {
    let status = match &e {
        AssetError::InvalidFilename(_) | AssetError::HashMismatch(_) => StatusCode::BAD_REQUEST,
        AssetError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        AssetError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Asset request failed: {}", e);
    } else {
        warn!("Rejected asset request: {}", e);
    }
    (status, e.to_string())
}
