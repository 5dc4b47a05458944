//! Mapping of engine errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garden_common::error::{GardenError, WireError};
use thiserror::Error;

/// Result type alias for request handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Error returned by a request handler.
///
/// The body is always a [`WireError`] so clients can rebuild the
/// original [`GardenError`] variant.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub GardenError);

impl ApiError {
    /// HTTP status for the wrapped error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            GardenError::ContainerNotFound { .. }
            | GardenError::ProcessNotFound { .. }
            | GardenError::PropertyNotFound { .. } => StatusCode::NOT_FOUND,
            GardenError::HandleAlreadyExists { .. }
            | GardenError::SubnetOverlap { .. }
            | GardenError::IpAlreadyAllocated { .. }
            | GardenError::ContainerStopped { .. } => StatusCode::CONFLICT,
            GardenError::InvalidRequest { .. }
            | GardenError::InvalidNetOutRule { .. }
            | GardenError::Rootfs { .. }
            | GardenError::Serialization { .. } => StatusCode::BAD_REQUEST,
            GardenError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GardenError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            GardenError::Io { .. }
            | GardenError::Config { .. }
            | GardenError::Connection { .. }
            | GardenError::Server { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self(GardenError::Server {
            message: format!("request task failed: {err}"),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (status, Json(WireError::from(&self.0))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body(err: GardenError) -> (StatusCode, WireError) {
        let response = ApiError(err).into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found_and_keeps_the_handle() {
        let (status, wire) = body(GardenError::ContainerNotFound {
            handle: "asdf".into(),
        })
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            wire,
            WireError::ContainerNotFound {
                handle: "asdf".into()
            }
        );
    }

    #[tokio::test]
    async fn conflicts_and_bad_requests() {
        let (status, _) = body(GardenError::HandleAlreadyExists {
            handle: "h".into(),
        })
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, wire) = body(GardenError::InvalidNetOutRule {
            message: "Ports cannot be specified for Protocol ALL".into(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(wire, WireError::InvalidNetOutRule { .. }));
    }

    #[tokio::test]
    async fn io_errors_become_server_errors_with_their_text() {
        let (status, wire) = body(GardenError::io(
            "/depot/x",
            std::io::Error::other("disk on fire"),
        ))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            wire,
            WireError::Server {
                message: "I/O error at /depot/x: disk on fire".into()
            }
        );
    }
}
