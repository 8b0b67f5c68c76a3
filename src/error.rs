use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("failed to load backend {id}: {reason}")]
    BackendLoad { id: String, reason: String },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn backend_load(id: impl Into<String>, reason: impl ToString) -> Self {
        ServiceError::BackendLoad {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors a chat session cannot recover from. Everything else is reported
    /// to the client and the session keeps reading commands.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServiceError::Other(_))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BackendLoad { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Generation(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
