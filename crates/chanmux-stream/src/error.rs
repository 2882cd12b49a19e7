//! Error taxonomy of the streaming client.
//!
//! Every fault a frame can cause maps to one [`StreamError`] variant. The
//! processor matches on [`StreamError::is_fatal`] to decide between logging
//! and continuing, or turning the fault into a `Stop` command.

use thiserror::Error;

use crate::codes::ServerSignal;
use crate::registry::ChannelId;
use crate::transport::TransportError;

/// Faults raised by frame decoding, dispatch and the client API.
#[derive(Debug, Error)]
pub enum StreamError {
    /// An operation needed a live socket and there is none.
    #[error("not connected")]
    NotConnected,

    /// Socket level failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be decoded, or a required field is missing.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A control frame carried an `event` this client does not understand.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The account stream carried an inner tag this client does not understand.
    #[error("unknown account event: {0}")]
    UnknownAccountEvent(String),

    /// A subscription ack named a channel no handler exists for.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The server sent an error/info code missing from the code table.
    #[error("unknown server signal: code {code} ({msg})")]
    UnknownServerCode { code: u32, msg: String },

    /// The server reported a condition listed in the code table.
    #[error("server signal {signal:?} (code {code}, fatal={fatal}): {msg}")]
    Server { code: u32, signal: ServerSignal, fatal: bool, msg: String },

    /// A subscription ack reused an id that is still registered.
    #[error("channel {0} already registered")]
    AlreadyRegistered(ChannelId),

    /// A frame or request referenced an id that is not registered.
    #[error("channel {0} not registered")]
    NotRegistered(ChannelId),

    /// A registered channel has no heartbeat entry; registry and heartbeat
    /// state have diverged.
    #[error("channel {0} missing from heartbeat map")]
    HeartbeatMissing(ChannelId),

    /// The controller thread is gone and cannot take commands.
    #[error("controller gone")]
    ControllerGone,

    /// A worker thread could not be spawned.
    #[error("worker thread: {0}")]
    Worker(String),
}

impl StreamError {
    /// Whether the processor must stop the client after this fault.
    ///
    /// After an unknown event or a registry/heartbeat divergence the frame
    /// sequence can no longer be trusted; fatal server signals mean the
    /// client and server disagree on the protocol.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Server { fatal, .. } => *fatal,
            Self::UnknownEvent(_) | Self::HeartbeatMissing(_) => true,
            _ => false,
        }
    }
}
