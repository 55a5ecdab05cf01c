use thiserror::Error;

/// Retry classification for an [`EngineError`], mirroring the taxonomy of spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Not an error at all from the outbox's point of view (duplicate-key on create,
    /// row-not-found on delete) — the operation is dropped as if it had succeeded.
    AbsorbedAsSuccess,
    /// Worth retrying with backoff (5xx, timeout, throttling, local network blip).
    Retriable,
    /// Remote holds a newer basis; the op is discarded and the row is pulled back.
    RemoteWins,
    /// Not worth retrying (schema mismatch, auth revoked, malformed payload).
    Fatal,
}

/// Errors surfaced by the sync engine. Local-store failures are fatal and bubble to the
/// UI write that caused them (spec.md §7); every other kind is absorbed by the engine
/// and only exposed through the status observer (C9).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("local store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("network unavailable")]
    Offline,

    #[error("remote transient error: {0}")]
    RemoteTransient(String),

    #[error("remote conflict-shaped error: {0}")]
    RemoteConflict(String),

    #[error("remote rejected stale basis for {table}/{entity_id}")]
    RemoteStaleBasis { table: String, entity_id: String },

    #[error("remote fatal error: {0}")]
    RemoteFatal(String),

    #[error("resolver anomaly: {0}")]
    ResolverAnomaly(String),
}

impl EngineError {
    /// Classify this error for the push drain's retry/backoff decision (spec.md §7).
    pub fn retry_class(&self) -> RetryClass {
        match self {
            EngineError::Store(_) => RetryClass::Fatal,
            EngineError::Serde(_) => RetryClass::Fatal,
            EngineError::State(_) => RetryClass::Fatal,
            EngineError::Offline => RetryClass::Retriable,
            EngineError::RemoteTransient(_) => RetryClass::Retriable,
            EngineError::RemoteConflict(_) => RetryClass::AbsorbedAsSuccess,
            EngineError::RemoteStaleBasis { .. } => RetryClass::RemoteWins,
            EngineError::RemoteFatal(_) => RetryClass::Fatal,
            EngineError::ResolverAnomaly(_) => RetryClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
