use std::io;

use thiserror::Error;

/// Errors returned by the wireline engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or multiplexer operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Buffer allocation failed. `direct` tells whether the pool was
    /// configured for page-aligned (direct) or plain heap buffers.
    #[error("buffer allocation failed ({})", alloc_mode(*.direct))]
    BufferAllocation {
        /// Whether the failing pool was in direct-buffer mode.
        direct: bool,
    },
    /// TLS protocol error (handshake failure, malformed record, alert).
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// Outbound connect attempt did not complete within its timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// TLS handshake did not complete within the configured wait.
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    /// A blocking handshake wait was attempted from a dispatcher thread.
    /// Blocking there would deadlock the event loop; the wait is refused.
    #[error("blocking handshake wait on a dispatcher thread")]
    HandshakeOnLoopThread,
    /// The dispatcher refused a new connection at its configured limit.
    #[error("connection limit reached")]
    AtCapacity,
    /// The connection is closed or was never established.
    #[error("connection closed")]
    ConnectionClosed,
    /// The owning dispatcher has shut down; the task channel is gone.
    #[error("dispatcher gone")]
    DispatcherGone,
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

fn alloc_mode(direct: bool) -> &'static str {
    if direct { "direct" } else { "heap" }
}

