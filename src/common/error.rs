//! Error types for leasehold

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classes of store failure that are worth retrying.
///
/// Backends map their driver errors onto one of these at the boundary, so
/// retry decisions never depend on the text of a driver message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Lock conflict with another writer (deadlock / table locked)
    Deadlock,
    /// Store is busy and asked us to come back later
    Busy,
    /// Connection dropped mid-call
    BadConnection,
    /// Could not obtain a usable connection
    InvalidConnection,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Deadlock => write!(f, "deadlock"),
            TransientKind::Busy => write!(f, "busy"),
            TransientKind::BadConnection => write!(f, "bad connection"),
            TransientKind::InvalidConnection => write!(f, "invalid connection"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Store Errors ===
    #[error("Transient store error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Election key not found: {0}")]
    NotFound(String),

    #[error("Invalid election key: {0}")]
    InvalidKey(String),

    // === Election Errors ===
    #[error("Leader election not started: {0}")]
    NotStarted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Stable numeric code reported alongside store call metrics
    pub fn code(&self) -> u32 {
        match self {
            Error::Io(_) => 1001,
            Error::Transient { kind, .. } => match kind {
                TransientKind::Deadlock => 2001,
                TransientKind::Busy => 2002,
                TransientKind::BadConnection => 2003,
                TransientKind::InvalidConnection => 2004,
            },
            Error::Store(_) => 2100,
            Error::NotFound(_) => 2200,
            Error::InvalidKey(_) => 3001,
            Error::NotStarted(_) => 3002,
            Error::InvalidConfig(_) => 3003,
            Error::Internal(_) => 5000,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::NotStarted(_) => StatusCode::NOT_FOUND,
            Error::InvalidKey(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseLocked) => Error::Transient {
                kind: TransientKind::Deadlock,
                message: e.to_string(),
            },
            Some(ErrorCode::DatabaseBusy) => Error::Transient {
                kind: TransientKind::Busy,
                message: e.to_string(),
            },
            Some(ErrorCode::SystemIoFailure) | Some(ErrorCode::CannotOpen) => Error::Transient {
                kind: TransientKind::BadConnection,
                message: e.to_string(),
            },
            _ => Error::Store(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Transient {
            kind: TransientKind::InvalidConnection,
            message: e.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
