//! Client configuration.
//!
//! Converts the file-level [`FeedConfig`] into the typed settings the
//! connection manager runs with, including the startup subscription list
//! (every configured pair × every configured channel kind).

use std::time::Duration;

use chanmux_core::config::{Credentials, FeedConfig};

use crate::frame::SubscriptionRequest;

/// Settings of one [`StreamClient`](crate::client::StreamClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Age after which a silent channel counts as late.
    pub heartbeat_timeout: Duration,
    /// How long an unanswered ping may stay outstanding.
    pub ping_timeout: Duration,
    /// Bound on the TCP connect and on each handshake read or write.
    pub connect_timeout: Duration,
    /// Bound on one socket read.
    pub read_timeout: Duration,
    /// Bound on one inbound queue pop.
    pub queue_timeout: Duration,
    /// Bound on joining each worker in `stop()`.
    pub join_timeout: Duration,
    /// `conf` flags sent after connecting.
    pub conf_flags: Option<u64>,
    /// Credentials for the account stream; `auth` is sent after connecting.
    pub credentials: Option<Credentials>,
    /// Subscriptions issued on every fresh (non-replay) start.
    pub subscriptions: Vec<SubscriptionRequest>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            queue_timeout: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            conf_flags: None,
            credentials: None,
            subscriptions: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Build client settings from a validated feed config.
    pub fn from_feed_config(cfg: &FeedConfig) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(cfg.effective_heartbeat_timeout_sec()),
            ping_timeout: Duration::from_secs(cfg.effective_ping_timeout_sec()),
            connect_timeout: Duration::from_millis(cfg.effective_connect_timeout_ms()),
            read_timeout: Duration::from_millis(cfg.effective_read_timeout_ms()),
            queue_timeout: Duration::from_millis(cfg.effective_queue_timeout_ms()),
            join_timeout: Duration::from_millis(cfg.effective_join_timeout_ms()),
            conf_flags: cfg.conf_flags.filter(|f| *f != 0),
            credentials: cfg.credentials.clone(),
            subscriptions: startup_subscriptions(cfg),
        }
    }
}

/// Expand pairs × channel kinds into subscription requests.
///
/// Unknown kinds are skipped; `FeedConfig::validate` rejects them earlier.
pub fn startup_subscriptions(cfg: &FeedConfig) -> Vec<SubscriptionRequest> {
    let precision = cfg.effective_book_precision();
    let length = cfg.effective_book_length();
    let timeframe = cfg.effective_candle_timeframe();

    let mut subs = Vec::with_capacity(cfg.pairs.len() * cfg.channels.len());
    for pair in &cfg.pairs {
        for kind in &cfg.channels {
            let req = match kind.as_str() {
                "ticker" => SubscriptionRequest::ticker(pair),
                "trades" => SubscriptionRequest::trades(pair),
                "book" => SubscriptionRequest::book(pair, &precision, &length),
                "raw_book" => SubscriptionRequest::raw_book(pair, &length),
                "candles" => SubscriptionRequest::candles(pair, &timeframe),
                _ => continue,
            };
            subs.push(req);
        }
    }
    subs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_pairs_by_channels() {
        let cfg = FeedConfig {
            pairs: vec!["tBTCUSD".into(), "tETHUSD".into()],
            channels: vec!["ticker".into(), "raw_book".into(), "candles".into()],
            book_length: Some("100".into()),
            ..Default::default()
        };
        let subs = startup_subscriptions(&cfg);
        assert_eq!(subs.len(), 6);
        assert_eq!(subs[0], SubscriptionRequest::ticker("tBTCUSD"));
        assert_eq!(subs[1].channel, "book");
        assert_eq!(subs[1].params["prec"], json!("R0"));
        assert_eq!(subs[1].params["len"], json!("100"));
        assert_eq!(subs[2].params["key"], json!("trade:1m:tBTCUSD"));
        assert_eq!(subs[3], SubscriptionRequest::ticker("tETHUSD"));
    }

    #[test]
    fn zero_conf_flags_means_none() {
        let cfg = FeedConfig { conf_flags: Some(0), heartbeat_timeout_sec: Some(5), ..Default::default() };
        let client = ClientConfig::from_feed_config(&cfg);
        assert_eq!(client.conf_flags, None);
        assert_eq!(client.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(client.connect_timeout, Duration::from_secs(5));
        assert!(client.subscriptions.is_empty());
    }
}
