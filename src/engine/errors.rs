use thiserror::Error;

/// Errors that can arise while loading, persisting or committing engine state.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around JSON errors (asset catalogue, protocol payloads).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// A loaded or committed snapshot failed validation.
    #[error("invalid state: {0}")]
    InvalidState(#[from] crate::engine::snapshot::SnapshotError),

    /// An entity is already held where it is being added.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The space worker for a request is gone (shut down or never started).
    #[error("space unavailable: {0}")]
    SpaceUnavailable(String),

    /// Snapshot integrity can no longer be trusted; the shard must shut down.
    #[error("fatal invariant violated: {0}")]
    FatalInvariant(String),

    /// Internal error (task join errors, unexpected conditions)
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors after which the owning shard must stop accepting work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::FatalInvariant(_))
    }
}
