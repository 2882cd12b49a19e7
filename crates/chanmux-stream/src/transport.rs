//! Transport seam between the client and the socket.
//!
//! The connection manager only sees [`Connector`] and [`Socket`]; the
//! WebSocket implementation lives in [`crate::ws`], and tests drive the
//! client through the in-memory [`mock`] transport.

use std::time::Duration;

use thiserror::Error;

/// Socket level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connect attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer closed or reset the connection.
    #[error("connection closed")]
    Closed,

    /// Any other read/write failure.
    #[error("io error: {0}")]
    Io(String),
}

/// One open duplex connection carrying text frames.
pub trait Socket: Send {
    /// Write one text frame.
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Read one text frame, waiting at most the read timeout given at
    /// connect time. `Ok(None)` means the wait timed out (or a non-text
    /// frame was consumed) and is not an error.
    fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the connection. Must tolerate an already closed peer.
    fn close(&mut self);
}

/// Opens sockets. One call is one connect attempt, which must give up after
/// `connect_timeout`.
pub trait Connector: Send + Sync {
    fn connect(&self, connect_timeout: Duration, read_timeout: Duration) -> Result<Box<dyn Socket>, TransportError>;
}
