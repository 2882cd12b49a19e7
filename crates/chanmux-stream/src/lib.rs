//! # chanmux-stream
//!
//! Multiplexed streaming client for a channel-id based push protocol: one
//! WebSocket carries many logical channels (ticker, books, candles, trades
//! and the authenticated account stream), each identified by a
//! server-assigned `chanId`.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────── outbound queue ◄──── StreamClient (subscribe, ping, …)
//!             ▼
//! socket ◄─► Receiver ──► inbound queue ──► Processor ──► output queue ──► consumers
//!                                             │  Dispatcher + ChannelRegistry
//!                                             ▼
//!                                       command queue ──► Controller ──► ConnectionManager
//! ```
//!
//! - [`client`]: [`StreamClient`] and the lifecycle state machine
//! - [`dispatch`]: control events, server codes and data routing
//! - [`registry`] / [`heartbeat`]: channel table and liveness tracking
//! - [`channel`] / [`codes`]: closed lookup tables
//! - [`transport`] / [`ws`]: socket seam and the WebSocket implementation

pub mod channel;
pub mod client;
pub mod codes;
pub mod command;
pub mod config;
mod controller;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod gate;
pub mod heartbeat;
pub mod output;
mod processor;
mod receiver;
pub mod registry;
mod shared;
pub mod transport;
pub mod ws;

pub use client::{ConnectionState, StreamClient};
pub use command::Command;
pub use config::ClientConfig;
pub use error::StreamError;
pub use output::{OutputReceiver, OutputRecord};
pub use ws::WsConnector;
