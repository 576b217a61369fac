//! Crate-wide error taxonomy
//!
//! Shared semantic categories (InvalidArgument, PermissionDenied, NotFound,
//! Unimplemented, Upstream, Integrity, TransientConflict) used across watermark
//! generation, detection, and registry handling. Each variant carries a
//! human-readable message; `status_code` maps it onto the HTTP status the
//! gateway/registry binaries should return.

use axum::http::StatusCode;

/// Semantic error categories shared by every module in this crate.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("conflict: {0}")]
    TransientConflict(String),
}

impl WatermarkError {
    /// HTTP status this error should be surfaced as by the gateway/registry binaries.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WatermarkError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            WatermarkError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            WatermarkError::NotFound(_) => StatusCode::NOT_FOUND,
            WatermarkError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
            WatermarkError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            WatermarkError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WatermarkError::TransientConflict(_) => StatusCode::CONFLICT,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WatermarkError>;

impl axum::response::IntoResponse for WatermarkError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
