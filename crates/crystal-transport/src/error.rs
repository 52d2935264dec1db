//! Error types for the transport subsystem.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error variants surfaced to callers of application-level send/receive.
///
/// Wire-level corruption is never surfaced: an undecryptable or malformed
/// packet is silently dropped and recovery is the sender's retransmission.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed or disposed.
    #[error("connection closed")]
    Closed,

    /// An operation did not complete within its deadline.
    #[error("timeout after {timeout_ms}ms")]
    Timeout {
        /// The deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// No usable network path.
    #[error("no network")]
    NoNetwork,

    /// The operation was cancelled.
    #[error("canceled")]
    Canceled,

    /// A payload exceeds what one transmission can carry.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// The offending payload size.
        size: usize,
        /// The maximum supported size.
        max: usize,
    },

    /// Serialization failure while building a frame.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
