use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Corrupted or tampered data: {0}")]
    CorruptedOrTampered(String),

    #[error("Transient transport error: {0}")]
    TransportTransient(String),

    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Sync conflict retries exhausted after {attempts} attempts")]
    SyncConflictExhausted { attempts: u32 },

    #[error("Client has been destroyed")]
    Destroyed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Coarse error classification carried by `sync_error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AuthFailure,
    CorruptedOrTampered,
    TransportTransient,
    BackendUnavailable,
    InvariantViolation,
    SyncConflictExhausted,
    Destroyed,
    Internal,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::NotFound(_) => ErrorKind::NotFound,
            DbError::Conflict(_) => ErrorKind::Conflict,
            DbError::AuthFailure(_) => ErrorKind::AuthFailure,
            DbError::CorruptedOrTampered(_) => ErrorKind::CorruptedOrTampered,
            DbError::TransportTransient(_) => ErrorKind::TransportTransient,
            DbError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            DbError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            DbError::SyncConflictExhausted { .. } => ErrorKind::SyncConflictExhausted,
            DbError::Destroyed => ErrorKind::Destroyed,
            DbError::IoError(_) => ErrorKind::TransportTransient,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the CAS retry loop may recover from this error locally.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }

    /// Rebuild an error from its kind and message, used where an error has
    /// to cross a clone boundary (the coalesced sync future).
    pub(crate) fn from_parts(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => DbError::NotFound(message),
            ErrorKind::Conflict => DbError::Conflict(message),
            ErrorKind::AuthFailure => DbError::AuthFailure(message),
            ErrorKind::CorruptedOrTampered => DbError::CorruptedOrTampered(message),
            ErrorKind::TransportTransient => DbError::TransportTransient(message),
            ErrorKind::BackendUnavailable => DbError::BackendUnavailable(message),
            ErrorKind::InvariantViolation => DbError::InvariantViolation(message),
            ErrorKind::SyncConflictExhausted => DbError::InternalError(message),
            ErrorKind::Destroyed => DbError::Destroyed,
            ErrorKind::Internal => DbError::InternalError(message),
        }
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
