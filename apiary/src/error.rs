use thiserror::Error;

/// Result type for apiary operations.
pub type ApiaryResult<T> = Result<T, ApiaryError>;

/// Errors surfaced by the tenant lifecycle, broker, and store layers.
///
/// Each variant maps to one semantic kind: validation failures become 400s
/// at the HTTP surface, missing resources 404s, and infrastructure failures
/// 500s. Queue-full rejections never reach HTTP; the runtime converts them
/// into dead-letter nacks.
#[derive(Debug, Error)]
pub enum ApiaryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
}

impl ApiaryError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Short label for the error kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid request",
            Self::NotFound(_) => "not found",
            Self::Store(_) => "store error",
            Self::Broker(_) => "broker error",
        }
    }
}
