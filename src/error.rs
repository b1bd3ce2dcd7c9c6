use axum::http::StatusCode;
use thiserror::Error;

/// Failures talking to the task-queue backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue configuration error: {0}")]
    Configuration(String),

    #[error("Failed to connect to queue backend: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("Failed to enqueue task: {0}")]
    Enqueue(#[source] redis::RedisError),

    #[error("Task id conflicts with an existing task: {0}")]
    Conflict(String),

    #[error("Queue client is closed")]
    Closed,
}

impl QueueError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Everything that can reject an inbound submission.
///
/// `Malformed` and `Invalid` are reported identically to callers but kept
/// apart so handlers can treat parse failures differently later.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("{0}")]
    Malformed(String),

    #[error("{}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Failed to encode task: {0}")]
    Encode(String),

    #[error("{0}")]
    Enqueue(#[from] QueueError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    MethodNotAllowed(String),
}

impl RequestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RequestError::Malformed(_) | RequestError::Invalid(_) | RequestError::Encode(_) => {
                StatusCode::BAD_REQUEST
            }
            RequestError::Enqueue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RequestError::NotFound(_) => StatusCode::NOT_FOUND,
            RequestError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Caller-facing messages, in the order they were detected.
    pub fn messages(&self) -> Vec<String> {
        match self {
            RequestError::Invalid(violations) => violations.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Failures translating between platform events and HTTP.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Invalid request path: {0}")]
    Uri(String),

    #[error("Body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),

    #[error("Failed to read response body: {0}")]
    Response(#[from] axum::Error),
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::Encode(e.to_string())
    }
}
