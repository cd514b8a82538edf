use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatashareError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid transition for batch {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("index query error: {0}")]
    IndexQuery(String),
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DatashareError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "Conflict",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::AccessDenied(_) => "AccessDenied",
            Self::IndexQuery(_) => "IndexQueryError",
            Self::IndexUnavailable(_) => "IndexUnavailable",
            Self::Timeout(_) => "Timeout",
            Self::Storage(_) | Self::Io(_) => "StorageError",
            Self::InternalError(_) => "InternalError",
        }
    }

    /// Errors raised by the storage layer that a later poll cycle may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, DatashareError>;
