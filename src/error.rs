// =============================================================================
// Error taxonomy for the feed engine
// =============================================================================
//
// Transient I/O errors (connect/read/subscribe) are retried under a bounded
// elapsed-time budget by the caller; parse errors on the stream are treated
// as transient and trigger a reconnect; persistence errors are logged and the
// single affected write is skipped.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport-level failure: connect, read, or forced close.
    #[error("connection error: {0}")]
    Connection(String),

    /// The exchange rejected or errored the channel subscription.
    #[error("subscription rejected: {0}")]
    Subscription(String),

    /// A message or response could not be parsed into a candle.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persisted-store failure for a single read or write.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Invalid nominal-interval encoding.
    #[error("interval error: {0}")]
    Interval(String),
}
