//! Crate-wide error taxonomy and its HTTP representation.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Everything the upload core can fail with.
///
/// Each variant carries enough context for the response body; the status
/// mapping lives in [`UploadError::status`].
#[derive(Debug, Error)]
pub enum UploadError {
    /// Name violates traversal, alphabet, or normalization rules.
    #[error("invalid path or filename")]
    InvalidPath,

    /// A single file crossed `max_filesize`.
    #[error("file exceeds the size limit")]
    FileTooLarge,

    /// The request as a whole crossed `max_transaction_size`.
    #[error("transaction exceeds the size limit")]
    TransactionTooLarge,

    /// `Content-Length` was present but not a decimal byte count.
    #[error("malformed Content-Length")]
    LengthInvalid,

    /// POST carried an envelope format other than multipart/form-data.
    #[error("unsupported envelope format")]
    UnsupportedEnvelope,

    /// The request body could not be decoded.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The URL path or the `Destination` header named no file.
    #[error("no destination given")]
    NoDestination,

    /// MOVE, COPY, or DELETE arrived while webdav methods are disabled.
    #[error("method not enabled")]
    WebdavDisabled,

    /// The final name exists as a directory, or source and destination collide.
    #[error("name conflict")]
    NameConflict,

    /// Operand was not found.
    #[error("no such file")]
    NotFound,

    /// Operation refused: scope root deletion, or a permission error.
    #[error("forbidden")]
    Forbidden,

    /// The Authorization header was present but malformed.
    #[error("{0}")]
    AuthBadRequest(String),

    /// No usable Authorization header; the client should supply one.
    #[error("authorization required")]
    AuthUnauthorized,

    /// Credentials were rejected, or the request is outside the time tolerance.
    #[error("method not authorized")]
    AuthForbidden,

    /// A write fell short, most likely due to exhausted space.
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Any other I/O or internal failure.
    #[error("{0}")]
    Internal(String),
}

impl UploadError {
    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidPath => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::FileTooLarge | UploadError::TransactionTooLarge => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            UploadError::LengthInvalid => StatusCode::LENGTH_REQUIRED,
            UploadError::UnsupportedEnvelope => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::NoDestination
            | UploadError::Malformed(_)
            | UploadError::AuthBadRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::WebdavDisabled => StatusCode::METHOD_NOT_ALLOWED,
            UploadError::NameConflict => StatusCode::CONFLICT,
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::Forbidden | UploadError::AuthForbidden => StatusCode::FORBIDDEN,
            UploadError::AuthUnauthorized => StatusCode::UNAUTHORIZED,
            UploadError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the authentication taxonomy, which `silent_auth_errors`
    /// collapses into delegation.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            UploadError::AuthBadRequest(_)
                | UploadError::AuthUnauthorized
                | UploadError::AuthForbidden
        )
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.to_string();
        if matches!(self, UploadError::AuthUnauthorized) {
            let headers = [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Signature"))];
            return (status, headers, body).into_response();
        }
        (status, body).into_response()
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(UploadError::InvalidPath.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(UploadError::FileTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(UploadError::LengthInvalid.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(UploadError::WebdavDisabled.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(UploadError::NameConflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            UploadError::InsufficientStorage("short write".into()).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response = UploadError::AuthUnauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).map(|v| v.as_bytes()),
            Some(&b"Signature"[..])
        );
    }

    #[test]
    fn auth_taxonomy_is_marked() {
        assert!(UploadError::AuthForbidden.is_auth());
        assert!(UploadError::AuthUnauthorized.is_auth());
        assert!(!UploadError::InvalidPath.is_auth());
    }
}
