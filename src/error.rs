//! Error types for the cache facade, backends and codecs.
//!
//! Backend failures never reach callers of `update` (the write path is
//! fire-and-forget past the enqueue). Read-side failures are logged and
//! degrade to `None` / `false`. `dispose` swallows everything.

use thiserror::Error;

/// Failure while encoding or decoding an element envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("element encode failed: {0}")]
    Encode(String),
    #[error("element decode failed: {0}")]
    Decode(String),
}

/// Failure reported by a persistence backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Recoverable storage failure (I/O, timeout, connection loss). The
    /// affected event is dropped; the queue keeps running.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The backend is unusable (misconfiguration, explicit destruction).
    #[error("fatal backend error: {0}")]
    Fatal(String),

    /// The element could not be encoded or decoded. Drops the single
    /// event; never counts toward the queue's error threshold.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The backend does not implement this operation.
    #[error("unsupported backend operation: {0}")]
    Unsupported(&'static str),
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        BackendError::Transient(e.to_string())
    }
}

impl From<r2d2::Error> for BackendError {
    fn from(e: r2d2::Error) -> Self {
        BackendError::Transient(format!("connection pool: {e}"))
    }
}

/// Failure surfaced by the cache facade itself.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The element key was empty.
    #[error("element key must not be empty")]
    EmptyKey,

    /// The event queue has been destroyed; the write was rejected.
    /// Reads keep working against the backend.
    #[error("event queue destroyed; update rejected")]
    QueueDestroyed,

    /// The writer thread could not be spawned at construction.
    #[error("failed to spawn writer thread: {0}")]
    WorkerSpawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_wraps_into_backend_error() {
        let err: BackendError = CodecError::Encode("bad".into()).into();
        assert!(matches!(err, BackendError::Codec(_)));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            CacheError::EmptyKey.to_string(),
            "element key must not be empty"
        );
        assert!(BackendError::Unsupported("get_group_keys")
            .to_string()
            .contains("get_group_keys"));
    }
}
