//! The domain error taxonomy (spec §7) and its mapping onto HTTP responses.
//!
//! Mirrors the donor's `CommitmentRequestError`: one `thiserror` enum that
//! implements `axum::response::IntoResponse` directly, so handlers can
//! return `Result<Json<T>, LogError>` and let the router do the rest.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("malformed COSE/CBOR input: {0}")]
    InvalidCose(String),

    #[error("unsupported algorithm or verifiable-data-structure: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("not found")]
    NotFound,

    #[error("requested parameters are out of range: {0}")]
    OutOfRange(String),

    #[error("transient failure, retry later: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("on-disk integrity violation detected: {0}")]
    Integrity(String),

    #[error("tile missing from blob store: level={level} index={index}")]
    TileMissing { level: u8, index: u64 },

    /// A unique-constraint hit on `entries.statement_hash` (spec §4.2): a
    /// benign duplicate-insert race, not corruption. `Registrar` catches
    /// this itself and turns it into `DedupeOutcome::AlreadyExists`; it only
    /// reaches a response if that re-lookup somehow fails too.
    #[error("duplicate statement_hash (unique constraint hit)")]
    DuplicateStatement,
}

impl LogError {
    fn status(&self) -> StatusCode {
        match self {
            LogError::InvalidCose(_)
            | LogError::UnsupportedAlgorithm(_)
            | LogError::InvalidSignature
            | LogError::OutOfRange(_) => StatusCode::BAD_REQUEST,
            LogError::NotFound => StatusCode::NOT_FOUND,
            LogError::Transient(_) => StatusCode::TOO_MANY_REQUESTS,
            LogError::Storage(_) | LogError::Integrity(_) | LogError::TileMissing { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            LogError::DuplicateStatement => StatusCode::CONFLICT,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            LogError::InvalidCose(_) => "invalid-cose",
            LogError::UnsupportedAlgorithm(_) => "unsupported-algorithm",
            LogError::InvalidSignature => "invalid-signature",
            LogError::NotFound => "not-found",
            LogError::OutOfRange(_) => "out-of-range",
            LogError::Transient(_) => "transient",
            LogError::Storage(_) => "storage-error",
            LogError::Integrity(_) => "integrity-violation",
            LogError::TileMissing { .. } => "tile-missing",
            LogError::DuplicateStatement => "duplicate-statement",
        }
    }
}

/// RFC 7807-shaped error body.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    status: u16,
    detail: String,
}

impl IntoResponse for LogError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let title = self.title();
        let body = ProblemDetails {
            kind: title,
            title,
            status: status.as_u16(),
            detail: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let LogError::Transient(_) = self {
            response
                .headers_mut()
                .insert("Retry-After", "1".parse().expect("valid header value"));
        }
        response
    }
}
