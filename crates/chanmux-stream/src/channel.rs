//! Channel kinds and labels.
//!
//! A subscription ack binds a server-assigned id to a [`ChannelKind`]; the
//! kind decides the output topic. The authenticated account stream carries
//! an inner tag that is resolved through [`AccountEvent`].

use serde_json::{Map, Value};

use crate::error::StreamError;

/// Keys of an ack that describe the transport, not the subscription.
const TRANSPORT_KEYS: &[&str] = &["event", "len", "chanId"];

/// Keys the server adds to an ack that a `subscribe` frame never carries.
const ACK_ONLY_KEYS: &[&str] = &["event", "chanId", "pair", "currency"];

/// Book precision that selects the raw (per-order) book.
const RAW_PRECISION: &str = "R0";

/// Data handler bound to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Ticker,
    Book,
    RawBook,
    Candles,
    Trades,
    /// Authenticated account stream (channel 0).
    Account,
}

impl ChannelKind {
    /// Derive the kind from a `subscribed` ack's `channel` and parameters.
    pub fn from_subscription(channel: &str, params: &Map<String, Value>) -> Result<Self, StreamError> {
        match channel {
            "ticker" => Ok(Self::Ticker),
            "book" => {
                if params.get("prec").and_then(Value::as_str) == Some(RAW_PRECISION) {
                    Ok(Self::RawBook)
                } else {
                    Ok(Self::Book)
                }
            }
            "candles" => Ok(Self::Candles),
            "trades" => Ok(Self::Trades),
            other => Err(StreamError::UnknownChannel(other.to_string())),
        }
    }

    /// Output topic for market data kinds. Account records take their topic
    /// from the inner [`AccountEvent`].
    pub fn topic(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Book => "order_book",
            Self::RawBook => "raw_order_book",
            Self::Candles => "ohlc",
            Self::Trades => "trades",
            Self::Account => "account",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Inner event of the account stream, `[0, tag, data]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEvent {
    Trades,
    Positions,
    Orders,
    Wallet,
    Balance,
    Margin,
    Funding,
    Offers,
    Credits,
    Loans,
    Notifications,
}

impl AccountEvent {
    /// Resolve an inner tag; a miss is an unknown account event.
    pub fn from_tag(tag: &str) -> Result<Self, StreamError> {
        let ev = match tag {
            "te" | "tu" => Self::Trades,
            "ps" | "pn" | "pu" | "pc" => Self::Positions,
            "os" | "on" | "ou" | "oc" => Self::Orders,
            "ws" | "wu" => Self::Wallet,
            "bu" => Self::Balance,
            "miu" => Self::Margin,
            "fiu" | "fte" | "ftu" => Self::Funding,
            "fos" | "fon" | "fou" | "foc" => Self::Offers,
            "fcs" | "fcn" | "fcu" | "fcc" => Self::Credits,
            "fls" | "fln" | "flu" | "flc" => Self::Loans,
            "n" => Self::Notifications,
            other => return Err(StreamError::UnknownAccountEvent(other.to_string())),
        };
        Ok(ev)
    }

    pub fn topic(self) -> &'static str {
        match self {
            Self::Trades => "account_trades",
            Self::Positions => "account_positions",
            Self::Orders => "account_orders",
            Self::Wallet => "account_wallet",
            Self::Balance => "account_balance",
            Self::Margin => "account_margin",
            Self::Funding => "account_funding",
            Self::Offers => "account_offers",
            Self::Credits => "account_credits",
            Self::Loans => "account_loans",
            Self::Notifications => "account_notifications",
        }
    }
}

/// What a registered channel was subscribed with.
///
/// Used to label output records and to replay the subscription after a soft
/// restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLabel {
    pub kind: ChannelKind,
    /// Channel name as the server knows it (`"book"` for both book kinds).
    pub channel: String,
    /// Ack fields minus transport keys and `channel`.
    pub params: Map<String, Value>,
    /// Parameters to resubscribe with: the request that produced the ack
    /// when it is known, else the ack minus server-added keys.
    pub subscription: Map<String, Value>,
}

impl ChannelLabel {
    /// Build a label from a `subscribed` ack.
    pub fn from_subscribed_ack(ack: &Map<String, Value>) -> Result<Self, StreamError> {
        let channel = ack
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::MalformedPayload("subscribed ack without channel".into()))?
            .to_string();
        let params = strip_keys(ack, TRANSPORT_KEYS);
        let kind = ChannelKind::from_subscription(&channel, &params)?;
        let subscription = strip_keys(ack, ACK_ONLY_KEYS);
        Ok(Self { kind, channel, params, subscription })
    }

    /// Build the label of the account stream from an `auth` ack.
    pub fn from_auth_ack(ack: &Map<String, Value>) -> Self {
        Self {
            kind: ChannelKind::Account,
            channel: "auth".into(),
            params: strip_keys(ack, TRANSPORT_KEYS),
            subscription: Map::new(),
        }
    }

    /// Instrument of the channel: `pair`, else `symbol`, else the last
    /// segment of a candle `key` (`trade:1m:tBTCUSD`). Empty for the account
    /// stream.
    pub fn pair(&self) -> String {
        let get = |k: &str| self.params.get(k).and_then(Value::as_str);
        if let Some(p) = get("pair").or_else(|| get("symbol")) {
            return p.to_string();
        }
        get("key")
            .and_then(|k| k.rsplit(':').next())
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// Whether this subscription can be replayed with a `subscribe` frame.
    /// The account stream comes back through `auth` instead.
    pub fn is_replayable(&self) -> bool {
        self.kind != ChannelKind::Account
    }
}

fn strip_keys(ack: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    ack.iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()) && k.as_str() != "channel")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn raw_precision_maps_to_raw_book() {
        let ack = obj(json!({"event": "subscribed", "channel": "book", "chanId": 7,
                             "symbol": "tBTCUSD", "prec": "R0", "len": "25"}));
        let label = ChannelLabel::from_subscribed_ack(&ack).unwrap();
        assert_eq!(label.kind, ChannelKind::RawBook);
        assert_eq!(label.kind.topic(), "raw_order_book");

        let ack = obj(json!({"event": "subscribed", "channel": "book", "chanId": 8, "prec": "P1"}));
        assert_eq!(ChannelLabel::from_subscribed_ack(&ack).unwrap().kind, ChannelKind::Book);
    }

    #[test]
    fn label_strips_transport_keys() {
        let ack = obj(json!({"event": "subscribed", "channel": "ticker", "chanId": 3,
                             "symbol": "tETHUSD", "pair": "ETHUSD", "len": "25"}));
        let label = ChannelLabel::from_subscribed_ack(&ack).unwrap();
        assert_eq!(label.channel, "ticker");
        assert_eq!(label.params, obj(json!({"symbol": "tETHUSD", "pair": "ETHUSD"})));
        assert_eq!(label.pair(), "ETHUSD");
    }

    #[test]
    fn resubscription_params_keep_book_length() {
        let ack = obj(json!({"event": "subscribed", "channel": "book", "chanId": 4, "symbol": "tBTCUSD",
                             "pair": "BTCUSD", "prec": "P0", "freq": "F0", "len": "100"}));
        let label = ChannelLabel::from_subscribed_ack(&ack).unwrap();
        assert_eq!(label.subscription, obj(json!({"symbol": "tBTCUSD", "prec": "P0", "freq": "F0", "len": "100"})));
        assert!(!label.params.contains_key("len"));
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let ack = obj(json!({"event": "subscribed", "channel": "status", "chanId": 3}));
        assert!(matches!(ChannelLabel::from_subscribed_ack(&ack), Err(StreamError::UnknownChannel(c)) if c == "status"));
    }

    #[test]
    fn candle_pair_comes_from_key() {
        let ack = obj(json!({"event": "subscribed", "channel": "candles", "chanId": 9, "key": "trade:1m:tBTCUSD"}));
        let label = ChannelLabel::from_subscribed_ack(&ack).unwrap();
        assert_eq!(label.kind.topic(), "ohlc");
        assert_eq!(label.pair(), "tBTCUSD");
    }

    #[test]
    fn account_tags() {
        assert_eq!(AccountEvent::from_tag("te").unwrap(), AccountEvent::Trades);
        assert_eq!(AccountEvent::from_tag("pu").unwrap().topic(), "account_positions");
        assert_eq!(AccountEvent::from_tag("flc").unwrap(), AccountEvent::Loans);
        assert!(matches!(AccountEvent::from_tag("zz"), Err(StreamError::UnknownAccountEvent(_))));
    }

    #[test]
    fn account_label_is_not_replayable() {
        let ack = obj(json!({"event": "auth", "status": "OK", "chanId": 0, "userId": 1}));
        let label = ChannelLabel::from_auth_ack(&ack);
        assert_eq!(label.kind, ChannelKind::Account);
        assert!(!label.is_replayable());
        assert_eq!(label.pair(), "");
    }
}
