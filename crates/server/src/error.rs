use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use snafu::Snafu;
use threadline_storage::{StorageError, StreamId, StreamStatus};

use crate::generation::GenerationError;
use crate::lifecycle::LifecycleError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("{details}"))]
    Validation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("request is not authenticated"))]
    Unauthenticated { stage: &'static str },
    #[snafu(display("stream {stream_id} belongs to another user"))]
    Forbidden {
        stage: &'static str,
        stream_id: StreamId,
    },
    #[snafu(display("stream {stream_id} was not found"))]
    NotFound {
        stage: &'static str,
        stream_id: StreamId,
    },
    #[snafu(display("stream {stream_id} is already {status} and cannot be resumed"))]
    NotResumable {
        stage: &'static str,
        stream_id: StreamId,
        status: StreamStatus,
    },
    #[snafu(display("stream storage failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("generation could not start: {source}"))]
    Generation {
        stage: &'static str,
        source: GenerationError,
    },
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::NotResumable { .. } => "not_resumable",
            Self::Storage { .. } => "storage",
            Self::Generation { .. } => "generation",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotResumable { .. } => StatusCode::CONFLICT,
            Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Generation { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            Self::Validation { stage, .. }
            | Self::Unauthenticated { stage }
            | Self::Forbidden { stage, .. }
            | Self::NotFound { stage, .. }
            | Self::NotResumable { stage, .. }
            | Self::Storage { stage, .. }
            | Self::Generation { stage, .. } => *stage,
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::NotResumable {
                stage,
                stream_id,
                status,
            } => Self::NotResumable {
                stage,
                stream_id,
                status,
            },
            LifecycleError::StreamNotFound { stage, stream_id } => {
                Self::NotFound { stage, stream_id }
            }
            LifecycleError::Storage { stage, source } => Self::Storage { stage, source },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(stage = self.stage(), error = %self, "request failed");
        } else {
            tracing::debug!(stage = self.stage(), error = %self, "request rejected");
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_map_to_distinct_statuses() {
        let stream_id = StreamId::new_v7();
        let not_resumable = ApiError::from(LifecycleError::NotResumable {
            stage: "test",
            stream_id,
            status: StreamStatus::Resumed,
        });
        let not_found = ApiError::from(LifecycleError::StreamNotFound {
            stage: "test",
            stream_id,
        });

        assert_eq!(not_resumable.status_code(), StatusCode::CONFLICT);
        assert_eq!(not_resumable.kind(), "not_resumable");
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_failures_are_server_errors() {
        let error = ApiError::Storage {
            stage: "test",
            source: StorageError::InvariantViolation {
                stage: "test",
                details: "broken".to_string(),
            },
        };
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
