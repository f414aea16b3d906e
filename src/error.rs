//! Error types surfaced through read completion handles

use thiserror::Error;

/// Errors a read request can resolve with.
///
/// Every failure is delivered through the failing read's own
/// [`ReadHandle`](crate::ReadHandle); nothing is raised across the
/// event-dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// A second read was issued while one was still outstanding. The
    /// original pending read is unaffected.
    #[error("another read operation is already in progress")]
    ConcurrentRead,

    /// The armed deadline elapsed before enough bytes arrived. Any bytes
    /// buffered so far are handed back to the source, and the reader is
    /// terminated.
    #[error("stream timeout")]
    Timeout,

    /// The source terminated while the read was outstanding. Buffered bytes
    /// are discarded, and the reader is terminated.
    #[error("stream closed")]
    Closed,

    /// The reader had already been terminated by a timeout, a source
    /// closure, or an explicit close.
    #[error("reader is closed")]
    ReaderClosed,
}
