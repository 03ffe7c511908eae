//! Engine Error Taxonomy
//!
//! One error enum for the whole engine. Foreground calls surface these to the
//! caller without partial state; background workers log and reschedule.

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller-side validation failure
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Referenced id does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Double-close, duplicate id, or schema-version mismatch
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Frame stack depth bound exceeded
    #[error("Frame stack overflow: depth {depth} exceeds bound {bound}")]
    FrameStackOverflow { depth: usize, bound: usize },
    /// Event payload exceeds the encoded size limit
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    /// Operation on a suspended or closed session
    #[error("Session not active: {0}")]
    SessionNotActive(String),
    /// The store has not been created in this project
    #[error("Project not initialized: {0}")]
    ProjectNotInitialized(String),
    /// I/O failure on the store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    /// Codec tag mismatch or checksum failure
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
    /// Deadline exceeded; no partial state left behind
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Best-effort subsystem temporarily unavailable
    #[error("Degraded: {0}")]
    Degraded(String),
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable error code carried in the tool-surface envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "InvalidArgument",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Conflict(_) => "Conflict",
            EngineError::FrameStackOverflow { .. } => "FrameStackOverflow",
            EngineError::PayloadTooLarge { .. } => "PayloadTooLarge",
            EngineError::SessionNotActive(_) => "SessionNotActive",
            EngineError::ProjectNotInitialized(_) => "ProjectNotInitialized",
            EngineError::StoreUnavailable(_) => "StoreUnavailable",
            EngineError::CorruptRecord(_) => "CorruptRecord",
            EngineError::Timeout(_) => "Timeout",
            EngineError::Degraded(_) => "DegradedMode",
            EngineError::Database(_) => "StoreUnavailable",
            EngineError::Io(_) => "StoreUnavailable",
        }
    }

    /// Whether an internal retry with backoff is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StoreUnavailable(_) | EngineError::Database(_) | EngineError::Io(_)
        )
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;
