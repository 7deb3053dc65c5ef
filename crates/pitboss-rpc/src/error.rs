//! Error bodies on the HTTP surfaces.
//!
//! Handlers return `ApiError`, which renders as the kind's status code and
//! a `{code, message, details?}` body. Clients turn such a body back into
//! the same `PitbossError` kind with `decode_error`.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use pitboss_contracts::error::{ErrorBody, ErrorKind, ForbiddenReason, PitbossError};

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub PitbossError);

impl From<PitbossError> for ApiError {
    fn from(e: PitbossError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(PitbossError::invalid("body", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

/// Rebuild the error behind a non-2xx response. Bodies that are not an
/// `ErrorBody` (a proxy page, an extractor rejection) fall back to a kind
/// chosen by status code.
pub fn decode_error(status: u16, body: &[u8]) -> PitbossError {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        return PitbossError::from_body(parsed);
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    let reason = if text.is_empty() { format!("HTTP {status}") } else { format!("HTTP {status}: {text}") };
    match status {
        400 | 422 => PitbossError::invalid("body", reason),
        401 => PitbossError::Unauthenticated { reason },
        403 => PitbossError::forbidden(ForbiddenReason::Rbac, reason),
        404 => PitbossError::not_found(reason),
        502 | 503 => PitbossError::UpstreamUnavailable { reason },
        504 => PitbossError::DeadlineExceeded { reason },
        _ => PitbossError::internal(reason),
    }
}

/// Status code for an error kind, as axum wants it.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, response::IntoResponse};

    use pitboss_contracts::error::{ErrorKind, PitbossError};

    use super::{decode_error, ApiError};

    #[tokio::test]
    async fn api_error_renders_status_and_body() {
        let response = ApiError(PitbossError::NotPending { id: "ap-1".to_string() }).into_response();
        assert_eq!(response.status().as_u16(), 409);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let err = decode_error(409, &bytes);
        assert_eq!(err, PitbossError::NotPending { id: "ap-1".to_string() });
    }

    #[test]
    fn non_error_bodies_map_by_status() {
        assert_eq!(decode_error(504, b"gateway timeout").kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(decode_error(401, b"").kind(), ErrorKind::Unauthenticated);
        assert_eq!(decode_error(415, b"Expected request with `Content-Type: application/json`").kind(), ErrorKind::Internal);
        match decode_error(422, b"missing field `job_id`") {
            PitbossError::InvalidArgument { field, reason } => {
                assert_eq!(field, "body");
                assert!(reason.contains("job_id"));
            }
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}
