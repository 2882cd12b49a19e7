//! # chanmux-core
//!
//! Shared infrastructure for the chanmux streaming client:
//!
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): `CoreError` via thiserror
//! - **Logging** (`logging`): tracing-based structured logging
//! - **Time utilities** (`time_util`): microsecond timestamps

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
