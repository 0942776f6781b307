use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    audio::audio_source::SourceError, service::concurrency_gate::GateClosed,
    service::engine::EngineError,
};

/// Request-level failure as seen by the client.
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error(transparent)]
    InvalidArgument(#[from] SourceError),
    /// Body did not parse as a transcription request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error(transparent)]
    Internal(#[from] EngineError),
    #[error("service is shutting down")]
    Unavailable,
}

impl From<GateClosed> for TranscribeError {
    fn from(_: GateClosed) -> Self {
        TranscribeError::Unavailable
    }
}

impl TranscribeError {
    pub fn code(&self) -> &'static str {
        match self {
            TranscribeError::InvalidArgument(_) | TranscribeError::MalformedRequest(_) => {
                "invalid_argument"
            }
            TranscribeError::Internal(_) => "internal",
            TranscribeError::Unavailable => "unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TranscribeError::InvalidArgument(_) | TranscribeError::MalformedRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            TranscribeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TranscribeError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn is_client_fault(&self) -> bool {
        self.status().is_client_error()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// `{"code": ..., "message": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for TranscribeError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn source_faults_are_invalid_argument() {
        let err: TranscribeError = SourceError::NotFound(PathBuf::from("/nope.wav")).into();
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("/nope.wav"));

        let err: TranscribeError = SourceError::FetchFailed("HTTP 404".into()).into();
        assert_eq!(err.code(), "invalid_argument");
        assert!(err.is_client_fault());
    }

    #[test]
    fn engine_faults_are_internal() {
        let err: TranscribeError = EngineError::Inference("boom".into()).into();
        assert_eq!(err.code(), "internal");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.is_client_fault());
    }

    #[test]
    fn closed_gate_is_unavailable() {
        let err: TranscribeError = GateClosed.into();
        assert_eq!(err.code(), "unavailable");
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn body_serializes_code_and_message() {
        let body = TranscribeError::MalformedRequest("expected value".into()).body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "invalid_argument");
        assert_eq!(json["message"], "malformed request: expected value");
    }
}
