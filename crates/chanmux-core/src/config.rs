//! Configuration parsing for the chanmux streaming client.
//!
//! The runner reads a single JSON config file. The top-level structure holds
//! logging metadata, the endpoint, the instruments and channel kinds to
//! subscribe at start, and the timing knobs of the receive/process pipeline.
//!
//! # Example config
//!
//! ```json
//! {
//!   "module": { "module_name": "bitfinex_feed", "log_path": "/tmp/log" },
//!   "url": "wss://api-pub.bitfinex.com/ws/2",
//!   "pairs": ["tBTCUSD", "tETHUSD"],
//!   "channels": ["ticker", "trades", "book", "raw_book", "candles"],
//!   "book_precision": "P0",
//!   "book_length": "25",
//!   "candle_timeframe": "1m",
//!   "heartbeat_timeout_sec": 10
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::CoreError;

/// Default endpoint when `url` is omitted.
pub const DEFAULT_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

/// Top-level feed config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedConfig {
    /// Module metadata (name, log path).
    pub module: Option<ModuleMeta>,

    /// WebSocket endpoint.
    pub url: Option<String>,

    /// Instruments to subscribe at start, already in exchange format
    /// (e.g. `"tBTCUSD"`).
    #[serde(default)]
    pub pairs: Vec<String>,

    /// Channel kinds to subscribe for every pair: `ticker`, `trades`, `book`,
    /// `raw_book`, `candles`.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Book precision for `book` subscriptions (default `"P0"`).
    pub book_precision: Option<String>,

    /// Book length for `book` and `raw_book` subscriptions (default `"25"`).
    pub book_length: Option<String>,

    /// Candle timeframe for `candles` subscriptions (default `"1m"`).
    pub candle_timeframe: Option<String>,

    /// Seconds without a heartbeat before a channel counts as late (default 10).
    pub heartbeat_timeout_sec: Option<u64>,

    /// Seconds to wait for a pong before the connection is declared dead
    /// (default 10).
    pub ping_timeout_sec: Option<u64>,

    /// TCP connect and handshake timeout in milliseconds (default 5000).
    pub connect_timeout_ms: Option<u64>,

    /// Socket read timeout in milliseconds (default 100).
    pub read_timeout_ms: Option<u64>,

    /// Inbound queue pop timeout in milliseconds (default 100).
    pub queue_timeout_ms: Option<u64>,

    /// Bounded wait for worker threads on stop, in milliseconds (default 2000).
    pub join_timeout_ms: Option<u64>,

    /// Bitmask sent in a `conf` frame after connecting (0 or absent: none).
    pub conf_flags: Option<u64>,

    /// Optional API credentials for the authenticated account stream.
    pub credentials: Option<Credentials>,
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// API key pair for the `auth` handshake.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl FeedConfig {
    /// Returns the endpoint, defaulting to [`DEFAULT_URL`].
    pub fn effective_url(&self) -> String {
        self.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string())
    }

    /// Returns the module name, defaulting to `"chanmux"`.
    pub fn module_name(&self) -> String {
        self.module
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "chanmux".to_string())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.module.as_ref().and_then(|m| m.log_path.clone())
    }

    pub fn effective_book_precision(&self) -> String {
        self.book_precision.clone().unwrap_or_else(|| "P0".to_string())
    }

    pub fn effective_book_length(&self) -> String {
        self.book_length.clone().unwrap_or_else(|| "25".to_string())
    }

    pub fn effective_candle_timeframe(&self) -> String {
        self.candle_timeframe.clone().unwrap_or_else(|| "1m".to_string())
    }

    pub fn effective_heartbeat_timeout_sec(&self) -> u64 {
        self.heartbeat_timeout_sec.unwrap_or(10)
    }

    pub fn effective_ping_timeout_sec(&self) -> u64 {
        self.ping_timeout_sec.unwrap_or(10)
    }

    pub fn effective_connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.unwrap_or(5_000)
    }

    pub fn effective_read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms.unwrap_or(100)
    }

    pub fn effective_queue_timeout_ms(&self) -> u64 {
        self.queue_timeout_ms.unwrap_or(100)
    }

    pub fn effective_join_timeout_ms(&self) -> u64 {
        self.join_timeout_ms.unwrap_or(2_000)
    }

    /// Check values that deserialize fine but cannot drive a connection.
    pub fn validate(&self) -> Result<(), CoreError> {
        const KNOWN: &[&str] = &["ticker", "trades", "book", "raw_book", "candles"];

        if let Some(unknown) = self.channels.iter().find(|c| !KNOWN.contains(&c.as_str())) {
            return Err(CoreError::Config(format!("unknown channel kind: {unknown}")));
        }
        if !self.channels.is_empty() && self.pairs.is_empty() {
            return Err(CoreError::Config("channels configured without pairs".into()));
        }
        if self.effective_heartbeat_timeout_sec() == 0 {
            return Err(CoreError::Config("heartbeat_timeout_sec must be > 0".into()));
        }
        if self.effective_read_timeout_ms() == 0 || self.effective_queue_timeout_ms() == 0 {
            return Err(CoreError::Config("read/queue timeouts must be > 0".into()));
        }
        if self.effective_connect_timeout_ms() == 0 {
            return Err(CoreError::Config("connect_timeout_ms must be > 0".into()));
        }
        if let Some(creds) = &self.credentials {
            if creds.api_key.is_empty() || creds.api_secret.is_empty() {
                return Err(CoreError::Credentials("api_key and api_secret must both be set".into()));
            }
        }
        Ok(())
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<FeedConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: FeedConfig = serde_json::from_str(&content)?;
    config.validate()?;
    debug!(
        "config {} loaded: {} pair(s), {} channel kind(s), url={}",
        path.display(),
        config.pairs.len(),
        config.channels.len(),
        config.effective_url()
    );
    Ok(config)
}
