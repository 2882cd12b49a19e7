//! Wire frames: inbound decoding and outbound builders.
//!
//! Inbound text is either an ordered sequence `[chanId, ...payload]` (a data
//! frame) or an object with an `event` field (a control frame). Outbound
//! frames are always control objects.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value, json};
use sha2::Sha384;

use crate::error::StreamError;

/// Heartbeat marker in `payload[0]` of a data frame.
pub const HEARTBEAT: &str = "hb";

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `[chanId, ...payload]`.
    Data(Vec<Value>),
    /// `{ "event": ..., ... }`.
    Control(Map<String, Value>),
}

impl Frame {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, StreamError> {
        let v: Value = serde_json::from_str(text)
            .map_err(|e| StreamError::MalformedPayload(format!("{e}: {text}")))?;
        match v {
            Value::Array(items) => Ok(Frame::Data(items)),
            Value::Object(map) if map.contains_key("event") => Ok(Frame::Control(map)),
            other => Err(StreamError::MalformedPayload(format!("unexpected frame shape: {other}"))),
        }
    }
}

/// A decoded frame stamped with its receipt time.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub received_at_us: u64,
    pub frame: Frame,
}

/// A subscription as sent on the wire: channel name plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub channel: String,
    pub params: Map<String, Value>,
}

impl SubscriptionRequest {
    pub fn new(channel: impl Into<String>, params: Map<String, Value>) -> Self {
        Self { channel: channel.into(), params }
    }

    pub fn ticker(symbol: &str) -> Self {
        Self::new("ticker", params(&[("symbol", symbol)]))
    }

    pub fn trades(symbol: &str) -> Self {
        Self::new("trades", params(&[("symbol", symbol)]))
    }

    pub fn book(symbol: &str, precision: &str, length: &str) -> Self {
        Self::new("book", params(&[("symbol", symbol), ("prec", precision), ("len", length)]))
    }

    /// Raw (per-order) book: a `book` subscription with precision `R0`.
    pub fn raw_book(symbol: &str, length: &str) -> Self {
        Self::book(symbol, "R0", length)
    }

    /// Candles are keyed as `trade:<timeframe>:<symbol>`.
    pub fn candles(symbol: &str, timeframe: &str) -> Self {
        Self::new("candles", params(&[("key", &format!("trade:{timeframe}:{symbol}"))]))
    }

    /// Build the `subscribe` control frame.
    pub fn to_frame(&self) -> String {
        build_subscribe(&self.channel, &self.params)
    }
}

fn params(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
}

/// `{event: "subscribe", channel, ...params}`.
pub fn build_subscribe(channel: &str, params: &Map<String, Value>) -> String {
    let mut msg = Map::with_capacity(params.len() + 2);
    msg.insert("event".into(), json!("subscribe"));
    msg.insert("channel".into(), json!(channel));
    for (k, v) in params {
        if k != "event" && k != "channel" {
            msg.insert(k.clone(), v.clone());
        }
    }
    Value::Object(msg).to_string()
}

/// `{event: "unsubscribe", chanId}`.
pub fn build_unsubscribe(chan_id: i64) -> String {
    json!({"event": "unsubscribe", "chanId": chan_id}).to_string()
}

/// `{event: "conf", flags}`.
pub fn build_conf(flags: u64) -> String {
    json!({"event": "conf", "flags": flags}).to_string()
}

/// `{event: "ping", cid}`.
pub fn build_ping(cid: u64) -> String {
    json!({"event": "ping", "cid": cid}).to_string()
}

/// `{event: "auth", apiKey, authSig, authPayload, authNonce}`.
///
/// The payload is `"AUTH" + nonce`, signed with HMAC-SHA384 and hex encoded.
pub fn build_auth(api_key: &str, api_secret: &str, nonce: u64) -> Result<String, StreamError> {
    let payload = format!("AUTH{nonce}");
    let mut mac = Hmac::<Sha384>::new_from_slice(api_secret.as_bytes())
        .map_err(|e| StreamError::MalformedPayload(format!("auth secret: {e}")))?;
    mac.update(payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());

    Ok(json!({
        "event": "auth",
        "apiKey": api_key,
        "authSig": sig,
        "authPayload": payload,
        "authNonce": nonce,
    })
    .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_data_frame() {
        let f = Frame::decode(r#"[42,"hb"]"#).unwrap();
        assert_eq!(f, Frame::Data(vec![json!(42), json!("hb")]));
    }

    #[test]
    fn decodes_control_frame() {
        let f = Frame::decode(r#"{"event":"info","version":2}"#).unwrap();
        match f {
            Frame::Control(map) => assert_eq!(map["version"], json!(2)),
            _ => panic!("expected Control"),
        }
    }

    #[test]
    fn rejects_eventless_object_and_garbage() {
        assert!(matches!(Frame::decode(r#"{"foo":1}"#), Err(StreamError::MalformedPayload(_))));
        assert!(matches!(Frame::decode("not json"), Err(StreamError::MalformedPayload(_))));
        assert!(matches!(Frame::decode("17"), Err(StreamError::MalformedPayload(_))));
    }

    #[test]
    fn subscribe_frame_carries_params() {
        let mut params = Map::new();
        params.insert("symbol".into(), json!("tBTCUSD"));
        params.insert("prec".into(), json!("R0"));
        let v: Value = serde_json::from_str(&build_subscribe("book", &params)).unwrap();
        assert_eq!(v, json!({"event": "subscribe", "channel": "book", "symbol": "tBTCUSD", "prec": "R0"}));
    }

    #[test]
    fn auth_frame_is_signed() {
        let v: Value = serde_json::from_str(&build_auth("key", "secret", 1_700_000_000_000).unwrap()).unwrap();
        assert_eq!(v["event"], "auth");
        assert_eq!(v["apiKey"], "key");
        assert_eq!(v["authPayload"], "AUTH1700000000000");
        // SHA-384 → 48 bytes → 96 hex chars.
        assert_eq!(v["authSig"].as_str().unwrap().len(), 96);
    }
}
