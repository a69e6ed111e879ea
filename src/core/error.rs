//! Error types.
//!
//! Meridian distinguishes a small set of error kinds: durability failures
//! surface to the writer, decode failures truncate (WAL) or drop
//! (transport) the offending input, and transport failures degrade to a
//! boolean send result that the anti-entropy layer tolerates. Stale
//! mutations and replication-queue overflow are *not* errors; they are
//! counted through the metrics registry.

use thiserror::Error;

/// Error type for all fallible core operations.
#[derive(Debug, Error)]
pub enum MeridianError {
    /// WAL open/write/fsync failure. Fatal on open, propagated on write.
    #[error("durability failure while {context}: {source}")]
    Durability {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Malformed frame, record, or meta payload.
    #[error("decode failure: {message}")]
    Decode { message: String },

    /// A field mutation was applied to a value that is not a document.
    #[error("field mutation on a non-document value")]
    NotADocument,

    /// Connection establishment or socket-level failure.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// A violated internal invariant. Never expected in correct operation.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MeridianError {
    /// Wrap an I/O error from the durability path.
    pub fn durability(context: &'static str, source: std::io::Error) -> Self {
        Self::Durability { context, source }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type using [`MeridianError`].
pub type MeridianResult<T> = Result<T, MeridianError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_error_carries_context() {
        let err = MeridianError::durability(
            "appending batch",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.to_string().contains("appending batch"));
    }

    #[test]
    fn decode_error_format() {
        let err = MeridianError::decode("truncated frame");
        assert!(err.to_string().contains("truncated frame"));
    }
}
