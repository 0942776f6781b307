use std::{
    fs::Permissions,
    future::Future,
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::json;
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;

use crate::service::{
    errors::TranscribeError,
    transcribe_types::{TranscribeRequest, TranscriptChunk},
    transcription_service::{ChunkStream, TranscriptionService},
};

pub const NDJSON: &str = "application/x-ndjson";

/// Request bodies carry base64 audio plus a little JSON.
pub fn body_limit(max_audio_bytes: u64) -> usize {
    let limit = max_audio_bytes.saturating_mul(4) / 3 + 64 * 1024;
    usize::try_from(limit).unwrap_or(usize::MAX)
}

pub fn router(service: Arc<TranscriptionService>, max_audio_bytes: u64) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/v1/transcribe", post(transcribe_handler))
        .layer(DefaultBodyLimit::max(body_limit(max_audio_bytes)))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn transcribe_handler(
    State(service): State<Arc<TranscriptionService>>,
    payload: Result<Json<TranscribeRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = TranscribeError::MalformedRequest(rejection.body_text());
            tracing::warn!(code = err.code(), "Transcription rejected: {err}");
            return err.into_response();
        }
    };
    match service.transcribe(request).await {
        Ok(stream) => ndjson_response(stream),
        Err(e) => e.into_response(),
    }
}

fn ndjson_response(stream: ChunkStream) -> Response {
    let body = Body::from_stream(stream.map(encode_line));
    ([(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

/// One NDJSON line: a chunk, or `{"error": {...}}` for a mid-stream failure.
pub fn encode_line(
    item: Result<TranscriptChunk, TranscribeError>,
) -> Result<Bytes, serde_json::Error> {
    let mut line = match item {
        Ok(chunk) => serde_json::to_vec(&chunk)?,
        Err(e) => serde_json::to_vec(&json!({ "error": e.body() }))?,
    };
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Binds the socket, replacing a stale file left by an earlier run, and
/// restricts it to the owning user.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(socket = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Serves `app` until `shutdown` resolves, then removes the socket file.
pub async fn serve<P, F>(path: P, app: Router, shutdown: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: Future<Output = ()> + Send + 'static,
{
    let path = path.as_ref();
    let listener = bind_socket(path)?;
    tracing::info!(socket = %path.display(), "Listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %path.display(), "failed to remove socket: {e}"),
    }
    tracing::info!("Server stopped");
    result
}
