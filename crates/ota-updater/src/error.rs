//! Error types for the update engine.

use thiserror::Error;

/// Errors that can occur while applying or committing an update.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Local file header signature did not match
    #[error("Malformed archive (invalid file header)")]
    InvalidHeader,

    /// Entry uses a compression method other than "stored"
    #[error("Cannot handle compressed .zip (method {method})")]
    UnsupportedCompression { method: u16 },

    /// Stored entry declares different compressed and uncompressed sizes
    #[error("Malformed archive (size mismatch: compressed {compressed}, uncompressed {uncompressed})")]
    SizeMismatch { compressed: u32, uncompressed: u32 },

    /// Entry name does not fit the name buffer
    #[error("Too long file name ({len} bytes)")]
    NameTooLong { len: usize },

    /// First entry was not the manifest
    #[error("Expected {expected}, got {found}")]
    UnexpectedEntry { expected: &'static str, found: String },

    /// CRC-32 over the entry body does not match the header
    #[error("Invalid CRC for {name}: want 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    /// Manifest could not be parsed
    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    /// Manifest lacks a required field
    #[error("Required manifest field missing: {0}")]
    MissingManifestField(&'static str),

    /// Manifest is larger than the configured limit
    #[error("Manifest too large: {size} bytes (limit {limit})")]
    ManifestTooLarge { size: u64, limit: u64 },

    /// Manifest targets another platform
    #[error("Wrong platform: want \"{expected}\", got \"{actual}\"")]
    WrongPlatform { expected: String, actual: String },

    /// Buffer allocation failed
    #[error("Out of memory")]
    OutOfMemory,

    /// Flashing backend reported a failure
    #[error("{0}")]
    Backend(String),

    /// Backend did not consume the whole entry tail
    #[error("Not all data was processed ({consumed} of {expected} bytes)")]
    IncompleteWrite { expected: usize, consumed: usize },

    /// Another session holds the active slot
    #[error("Update already in progress")]
    AlreadyInProgress,

    /// Previous update is still awaiting commit
    #[error("Previous update has not been committed yet")]
    NotCommitted,

    /// Operation is not valid in the session's current state
    #[error("Update is not ready: {0}")]
    NotReady(String),

    /// Session watchdog expired
    #[error("Update timed out")]
    TimedOut,

    /// Session was aborted by its owner
    #[error("Update aborted: {0}")]
    Aborted(String),

    /// Commit state could not be persisted or read
    #[error("Cannot save update status: {0}")]
    CommitState(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure reported by a flashing backend, carrying its status message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<BackendError> for UpdateError {
    fn from(err: BackendError) -> Self {
        UpdateError::Backend(err.0)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError(err.to_string())
    }
}
