//! Error types and request-layer mapping.
//!
//! Bulletin surfaces a small, closed set of failure kinds. The upstream
//! request layer must be able to tell them apart, so every variant maps to a
//! stable [`ErrorKind`] and an HTTP status.

use thiserror::Error;

/// Common Bulletin error conditions.
#[derive(Debug, Error)]
pub enum BulletinError {
    /// Optimistic-concurrency loss: the stored version moved since it was read.
    #[error("conflict on {namespace}/{key}: expected version {expected}, found {actual}")]
    Conflict {
        namespace: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Record not found.
    #[error("record not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },

    /// Create targeted a key that already exists.
    #[error("record already exists: {namespace}/{key}")]
    AlreadyExists { namespace: String, key: String },

    /// Envelope references a key label absent from the key set.
    #[error("unknown encryption key: {label}")]
    UnknownKey { label: String },

    /// AEAD authentication failed or the envelope is malformed.
    #[error("decryption failed with key {label}: {reason}")]
    DecryptionFailed { label: String, reason: String },

    /// Encryption could not be performed (random source failure).
    #[error("encryption failed: {message}")]
    Encryption { message: String },

    /// Stored or submitted record could not be decoded or failed validation.
    #[error("invalid record: {message}")]
    InvalidRecord { message: String },

    /// Migration pipeline failed; the process must not serve writes.
    #[error("migration to version {version} failed: {message}")]
    MigrationFatal { version: u64, message: String },

    /// Lock renewal failed; the process must stop serving writes.
    #[error("lock lost: {reason}")]
    LockLost { reason: String },

    /// Lock is currently held by another presence.
    #[error("lock {lock_key} held by {holder}")]
    LockHeld { lock_key: String, holder: String },

    /// Subscriber fell behind and was disconnected.
    #[error("subscriber buffer overflowed")]
    Overflow,

    /// Event hub has been closed.
    #[error("event hub closed")]
    HubClosed,

    /// Callback queue is full under the reject submission policy.
    #[error("callback work pool saturated")]
    PoolSaturated,

    /// Callback work pool has shut down.
    #[error("callback work pool closed")]
    PoolClosed,

    /// Engine I/O or driver failure.
    #[error("backend error: {message}")]
    Backend { message: String },
}

/// Stable error classification for the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    AlreadyExists,
    UnknownKey,
    DecryptionFailed,
    Encryption,
    InvalidRecord,
    MigrationFatal,
    LockLost,
    LockHeld,
    Overflow,
    HubClosed,
    PoolSaturated,
    PoolClosed,
    Backend,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Conflict => "Conflict",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::UnknownKey => "UnknownKey",
            Self::DecryptionFailed => "DecryptionFailed",
            Self::Encryption => "Encryption",
            Self::InvalidRecord => "InvalidRecord",
            Self::MigrationFatal => "MigrationFatal",
            Self::LockLost => "LockLost",
            Self::LockHeld => "LockHeld",
            Self::Overflow => "Overflow",
            Self::HubClosed => "HubClosed",
            Self::PoolSaturated => "PoolSaturated",
            Self::PoolClosed => "PoolClosed",
            Self::Backend => "Backend",
        };
        f.write_str(name)
    }
}

impl BulletinError {
    /// Create a Conflict error.
    pub fn conflict(namespace: impl Into<String>, key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            namespace: namespace.into(),
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Create a NotFound error.
    pub fn not_found(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Create a Backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create an InvalidRecord error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::UnknownKey { .. } => ErrorKind::UnknownKey,
            Self::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            Self::Encryption { .. } => ErrorKind::Encryption,
            Self::InvalidRecord { .. } => ErrorKind::InvalidRecord,
            Self::MigrationFatal { .. } => ErrorKind::MigrationFatal,
            Self::LockLost { .. } => ErrorKind::LockLost,
            Self::LockHeld { .. } => ErrorKind::LockHeld,
            Self::Overflow => ErrorKind::Overflow,
            Self::HubClosed => ErrorKind::HubClosed,
            Self::PoolSaturated => ErrorKind::PoolSaturated,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Check if a caller may retry the operation at a higher layer.
    ///
    /// Data-integrity failures (unknown key, failed decryption) and
    /// fail-stop conditions are never retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::LockHeld { .. }
                | Self::PoolSaturated
                | Self::Backend { .. }
        )
    }

    /// Check if this error requires the process to stop serving writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MigrationFatal { .. } | Self::LockLost { .. })
    }
}

/// Result type using BulletinError.
pub type BulletinResult<T> = Result<T, BulletinError>;

// ============================================================================
// Request-layer error mapping
// ============================================================================

/// HTTP status mapping for the request layer.
pub struct HttpErrorMapping;

impl HttpErrorMapping {
    /// Map a BulletinError to an HTTP status code.
    pub fn to_status(error: &BulletinError) -> u16 {
        match error.kind() {
            ErrorKind::Conflict => 409,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidRecord => 400,
            ErrorKind::PoolSaturated => 429,
            ErrorKind::Overflow | ErrorKind::HubClosed => 410,
            ErrorKind::LockHeld | ErrorKind::LockLost | ErrorKind::MigrationFatal => 503,
            ErrorKind::PoolClosed => 503,
            ErrorKind::UnknownKey
            | ErrorKind::DecryptionFailed
            | ErrorKind::Encryption
            | ErrorKind::Backend => 500,
        }
    }

    /// Stable error type string for response bodies.
    pub fn to_error_type(error: &BulletinError) -> String {
        match error {
            BulletinError::Conflict { .. } => "ResourceConflict".to_string(),
            BulletinError::AlreadyExists { .. } => "ResourceExists".to_string(),
            BulletinError::NotFound { .. } => "ResourceNotFound".to_string(),
            other => other.kind().to_string(),
        }
    }
}
