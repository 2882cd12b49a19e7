//! Typed error definitions shared by the chanmux crates.
//!
//! [`CoreError`] covers failures outside the streaming protocol itself. All
//! variants implement `std::error::Error` via `thiserror`, so they convert
//! into `anyhow::Error` at the binary edge.

use thiserror::Error;

/// Errors raised by the ambient layers (config, logging setup).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Credentials are partially configured.
    #[error("credentials error: {0}")]
    Credentials(String),
}
