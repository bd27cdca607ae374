//! Client error types.

use std::io;
use std::net::SocketAddr;

use shoal_protocol::ParseError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers.
///
/// Each variant carries a distinct recovery story. Transport failures
/// (`ConnectionReset`, `Io`) are safe to retry once the connection has come
/// back; `Authentication` is fatal until the configuration changes;
/// `Protocol` means the conversation desynchronized and the connection was
/// torn down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered something the pending operation cannot accept.
    /// The connection is reset afterwards to restore synchronization.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The SASL handshake failed, or the server demanded authentication
    /// the active dialect cannot provide. Never retried automatically.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The connection dropped with this operation queued or in flight.
    /// The operation may or may not have reached the server.
    #[error("connection reset")]
    ConnectionReset,

    /// I/O error while connecting or talking to a server.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The operation (or the connect it was waiting on) took too long.
    #[error("timed out")]
    Timeout,

    /// The shard owning this key has no usable connection right now.
    #[error("shard {0} unavailable")]
    ShardUnavailable(SocketAddr),

    /// Non-blocking submission refused: the connection's in-flight window
    /// is full.
    #[error("would block")]
    WouldBlock,

    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The client was shut down while this operation was pending.
    #[error("client closed")]
    Closed,
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Protocol(err.to_string())
    }
}
