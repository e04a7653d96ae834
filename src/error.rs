//! Error types for the Pressgate service.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::batch::{TaskId, TaskKind};

/// Main error type for Pressgate operations.
#[derive(Error, Debug)]
pub enum PressgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A submitted task failed validation
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// A task kind outside the supported set
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    /// No handler is registered for a task kind
    #[error("No handler registered for task kind {0}")]
    NoHandler(TaskKind),

    /// No task with this id exists
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<JsonRejection> for PressgateError {
    fn from(rejection: JsonRejection) -> Self {
        PressgateError::InvalidTask(rejection.body_text())
    }
}

impl PressgateError {
    /// HTTP status the error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PressgateError::InvalidTask(_)
            | PressgateError::UnknownKind(_)
            | PressgateError::NoHandler(_) => StatusCode::BAD_REQUEST,
            PressgateError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            PressgateError::Config(_) | PressgateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PressgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Result type alias for Pressgate operations.
pub type Result<T> = std::result::Result<T, PressgateError>;
