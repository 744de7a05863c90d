//! Error types for the transport.

use std::time::Duration;

use thiserror::Error;

/// Error type for transport operations.
///
/// Recoverable conditions (timeout, channel failure, exhaustion) are
/// distinct variants so callers can close-and-retry; illegal-state errors
/// signal a defect in the calling code, not the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A lifecycle operation was attempted from a state that does not
    /// permit it. Programmer error, not recoverable.
    #[error("illegal request state: expected {expected}, was {actual}")]
    IllegalState {
        expected: &'static str,
        actual: &'static str,
    },
    /// The request's channel closed or reported a send error while the
    /// request was open.
    #[error("request failed, channel {channel_id} closed")]
    RequestFailed { channel_id: i32 },
    /// No response arrived within the request timeout.
    #[error("request timed out after {after:?}")]
    RequestTimedOut { after: Duration },
    /// The connection is not open.
    #[error("connection {connection_id} is not open")]
    ConnectionNotOpen { connection_id: u64 },
    /// The request pool is exhausted. Recoverable: retry or back off.
    #[error("no request slot available")]
    NoAvailableRequests,
    /// The send log rejected the claim outright (no space).
    #[error("send log rejected claim of {length} bytes")]
    SendBufferFull { length: usize },
    /// The caller-supplied payload writer failed. Surfaced synchronously;
    /// the claimed fragment is aborted and no request state is published.
    #[error("request writer failed")]
    WriterFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A deferred response operation needs an allocated fragment.
    #[error("no allocated response fragment")]
    NoAllocatedResponse,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
