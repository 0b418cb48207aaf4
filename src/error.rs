use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MolidError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown identifier type: {0}")]
    InvalidIdentifierType(String),

    #[error("unknown search mode: {0}")]
    InvalidMode(String),

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("identifier type {id_type} is not supported by strategy {strategy}")]
    UnsupportedIdentifierForStrategy { id_type: String, strategy: String },

    #[error("no compound found for {id_type}={value}")]
    #[diagnostic(help("try another identifier type or search mode"))]
    NotFound { id_type: String, value: String },

    #[error("database not found: {0}")]
    #[diagnostic(help("create it with `molid db create` or point `molid config` at it"))]
    DatabaseNotFound(PathBuf),

    #[error("cache directory is not writable: {0}")]
    CacheNotWritable(PathBuf),

    #[error("insufficient disk space: {available} bytes available, {required} bytes required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response payload: {0}")]
    Json(String),

    #[error("checksum mismatch for {archive}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        archive: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {archive}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        archive: String,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("download of {archive} failed after {attempts} attempts: {last_error}")]
    DownloadExhausted {
        archive: String,
        attempts: usize,
        last_error: String,
    },

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("structure conversion failed: {0}")]
    Conversion(String),
}

impl MolidError {
    pub fn not_found(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NotFound {
            id_type: id_type.into(),
            value: value.into(),
        }
    }

    pub fn from_io(err: io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }

    /// Conditions that mean "this backend cannot answer", as opposed to defects.
    /// Auto mode moves on to the next strategy for these and aborts on anything else.
    pub fn is_fallthrough(&self) -> bool {
        match self {
            MolidError::NotFound { .. }
            | MolidError::UnsupportedIdentifierForStrategy { .. }
            | MolidError::DatabaseNotFound(_)
            | MolidError::CacheNotWritable(_) => true,
            MolidError::Store(err) => is_unavailable_store(err),
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MolidError::Http(_) | MolidError::Status { .. } | MolidError::DownloadExhausted { .. }
        )
    }
}

fn is_unavailable_store(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
                | ErrorCode::NotADatabase
        )
    )
}
