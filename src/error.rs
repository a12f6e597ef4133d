//! Error types for storage, arbitration and protocol operations

use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the arbiter, storage layer and request handlers
#[derive(Error, Debug)]
pub enum Error {
    /// Path does not exist on the card
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target already exists, or the operation conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed path, address, hex value or range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Request body too large for an in-memory operation
    #[error("Payload too large: {len} bytes (max {max})")]
    TooLarge { len: u64, max: u64 },

    /// Read/write failure on the card
    #[error("I/O error during {op} on {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Mount, unmount or bus switch failure
    #[error("Media error: {0}")]
    Media(String),

    /// Bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Settings file could not be parsed or written
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Classify an I/O error raised while running `op` against `path`
    pub fn from_io(op: &'static str, path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::Conflict(path.to_string()),
            _ => Error::Io {
                op,
                path: path.to_string(),
                source,
            },
        }
    }

    /// HTTP status code a handler should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::InvalidArgument(_) => 400,
            Error::TooLarge { .. } => 413,
            Error::Timeout(_) => 504,
            Error::Io { .. } | Error::Media(_) | Error::Config(_) => 500,
        }
    }
}
