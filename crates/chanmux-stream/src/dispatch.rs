//! Frame dispatch: control events and data routing.
//!
//! [`Dispatcher`] is driven by the processor thread. Control frames are
//! resolved through [`ControlEvent`] and the server code table; data frames
//! are routed by channel id to the kind bound at registration, which turns
//! them into [`OutputRecord`]s.
//!
//! ```text
//! Frame::Control ──► ControlEvent ──► register / deregister / codes / pong
//! Frame::Data    ──► registry.touch(id) ──► hb? stop : kind ──► OutputRecord
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chanmux_core::time_util;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::channel::{AccountEvent, ChannelKind, ChannelLabel};
use crate::codes::{self, CodeAction};
use crate::command::Command;
use crate::error::StreamError;
use crate::frame::{Frame, HEARTBEAT, InboundMessage};
use crate::heartbeat::HeartbeatReport;
use crate::output::{OutputQueue, OutputRecord};
use crate::registry::{ChannelId, ChannelRegistry};

/// Protocol version this client speaks.
const PROTOCOL_VERSION: u64 = 2;

/// Id of the authenticated account stream.
const ACCOUNT_CHANNEL: ChannelId = 0;

/// Inbound control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Subscribed,
    Unsubscribed,
    Auth,
    Unauth,
    Info,
    Pong,
    Conf,
    Error,
}

impl ControlEvent {
    pub fn parse(event: &str) -> Result<Self, StreamError> {
        let ev = match event {
            "subscribed" => Self::Subscribed,
            "unsubscribed" => Self::Unsubscribed,
            "auth" => Self::Auth,
            "unauth" => Self::Unauth,
            "info" => Self::Info,
            "pong" => Self::Pong,
            "conf" => Self::Conf,
            "error" => Self::Error,
            other => return Err(StreamError::UnknownEvent(other.to_string())),
        };
        Ok(ev)
    }
}

/// At most one outstanding `ping`, shared by the client API and the
/// processor.
#[derive(Debug, Default)]
pub struct PingTracker {
    state: Mutex<PingState>,
}

#[derive(Debug, Default)]
struct PingState {
    /// `(cid, sent_at_us)` of the unanswered ping.
    outstanding: Option<(u64, u64)>,
    last_cid: u64,
}

impl PingTracker {
    fn state(&self) -> MutexGuard<'_, PingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a ping id and mark it outstanding from `now_us`.
    pub fn start(&self, now_us: u64) -> u64 {
        let mut st = self.state();
        st.last_cid += 1;
        st.outstanding = Some((st.last_cid, now_us));
        st.last_cid
    }

    pub fn is_outstanding(&self) -> bool {
        self.state().outstanding.is_some()
    }

    pub fn is_overdue(&self, now_us: u64, timeout_us: u64) -> bool {
        self.state()
            .outstanding
            .is_some_and(|(_, sent)| time_util::elapsed_us(sent, now_us) > timeout_us)
    }

    /// Settle the outstanding ping if `cid` answers it; returns the RTT.
    pub fn answer(&self, cid: Option<u64>, at_us: u64) -> Option<(u64, u64)> {
        let mut st = self.state();
        match st.outstanding {
            Some((expected, sent)) if cid.is_none() || cid == Some(expected) => {
                st.outstanding = None;
                Some((expected, time_util::elapsed_us(sent, at_us)))
            }
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.state().outstanding = None;
    }
}

/// Routes decoded frames into registry updates, commands and output records.
pub struct Dispatcher {
    registry: Arc<Mutex<ChannelRegistry>>,
    output: OutputQueue,
    pings: Arc<PingTracker>,
    ping_timeout_us: u64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Mutex<ChannelRegistry>>,
        output: OutputQueue,
        pings: Arc<PingTracker>,
        ping_timeout: Duration,
    ) -> Self {
        Self { registry, output, pings, ping_timeout_us: time_util::duration_us(ping_timeout) }
    }

    fn registry(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch one message. A returned command must be handed to the
    /// controller.
    pub fn dispatch(&mut self, msg: &InboundMessage) -> Result<Option<Command>, StreamError> {
        match &msg.frame {
            Frame::Data(items) => {
                self.on_data(items, msg.received_at_us)?;
                Ok(None)
            }
            Frame::Control(map) => self.on_control(map, msg.received_at_us),
        }
    }

    /// Run the liveness check at `now_us`.
    pub fn check_heartbeats(&mut self, now_us: u64) -> Result<HeartbeatReport, StreamError> {
        self.registry().check_heartbeats(now_us)
    }

    // -----------------------------------------------------------------------
    // Ping bookkeeping
    // -----------------------------------------------------------------------

    /// Mark a new ping outstanding; returns its `cid`.
    pub fn start_ping(&self, now_us: u64) -> u64 {
        self.pings.start(now_us)
    }

    pub fn ping_outstanding(&self) -> bool {
        self.pings.is_outstanding()
    }

    /// An outstanding ping has gone unanswered for longer than the timeout.
    pub fn ping_overdue(&self, now_us: u64) -> bool {
        self.pings.is_overdue(now_us, self.ping_timeout_us)
    }

    pub fn clear_ping(&self) {
        self.pings.clear();
    }

    // -----------------------------------------------------------------------
    // Control plane
    // -----------------------------------------------------------------------

    fn on_control(&mut self, map: &Map<String, Value>, ts: u64) -> Result<Option<Command>, StreamError> {
        let event = map
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::MalformedPayload("control frame without event".into()))?;

        match ControlEvent::parse(event)? {
            ControlEvent::Subscribed => {
                let id = required_chan_id(map)?;
                let label = ChannelLabel::from_subscribed_ack(map)?;
                self.register(id, label, Some(map), ts)?;
                Ok(None)
            }
            ControlEvent::Auth if status_ok(map) => {
                let id = chan_id(map).unwrap_or(ACCOUNT_CHANNEL);
                self.register(id, ChannelLabel::from_auth_ack(map), None, ts)?;
                Ok(None)
            }
            ControlEvent::Auth => self.on_auth_failed(map),
            ControlEvent::Unsubscribed => {
                let id = required_chan_id(map)?;
                self.deregister(id)?;
                Ok(None)
            }
            ControlEvent::Unauth => {
                self.deregister(chan_id(map).unwrap_or(ACCOUNT_CHANNEL))?;
                Ok(None)
            }
            ControlEvent::Info => self.on_info(map),
            ControlEvent::Pong => {
                self.on_pong(map, ts);
                Ok(None)
            }
            ControlEvent::Conf => {
                if !status_ok(map) {
                    let frame = Value::Object(map.clone());
                    warn!("[dispatch] conf rejected: {frame}");
                }
                Ok(None)
            }
            ControlEvent::Error => {
                let code = map
                    .get("code")
                    .and_then(codes::parse_code)
                    .ok_or_else(|| StreamError::MalformedPayload("error frame without code".into()))?;
                self.on_code(code, message(map))
            }
        }
    }

    /// Register `id`; a `subscribed` ack also claims the request it answers,
    /// which is what a soft restart resends.
    fn register(
        &mut self,
        id: ChannelId,
        mut label: ChannelLabel,
        ack: Option<&Map<String, Value>>,
        ts: u64,
    ) -> Result<(), StreamError> {
        let kind = label.kind;
        let pair = label.pair();
        {
            let mut registry = self.registry();
            match ack.and_then(|ack| registry.claim_request(&label.channel, ack)) {
                Some(req) => label.subscription = req.params,
                None if ack.is_some() => debug!("[dispatch] channel {id} acked without a known request"),
                None => {}
            }
            registry.register(id, label, ts)?;
        }
        info!("[dispatch] channel {id} registered: {kind} {pair}");
        Ok(())
    }

    fn deregister(&mut self, id: ChannelId) -> Result<(), StreamError> {
        let channel = self.registry().deregister(id)?;
        info!("[dispatch] channel {id} removed: {} {}", channel.label.kind, channel.label.pair());
        Ok(())
    }

    /// A failed `auth` drops any account stream still registered and
    /// reports the server's reason. A first `auth` has nothing to drop.
    fn on_auth_failed(&mut self, map: &Map<String, Value>) -> Result<Option<Command>, StreamError> {
        let id = chan_id(map).unwrap_or(ACCOUNT_CHANNEL);
        {
            let mut registry = self.registry();
            if registry.contains(id) {
                registry.deregister(id)?;
            } else {
                debug!("[dispatch] auth failed with no account stream on channel {id}");
            }
        }
        match map.get("code").and_then(codes::parse_code) {
            Some(code) => self.on_code(code, message(map)),
            None => Err(StreamError::Server {
                code: 0,
                signal: codes::ServerSignal::AuthFailed,
                fatal: false,
                msg: message(map),
            }),
        }
    }

    fn on_info(&mut self, map: &Map<String, Value>) -> Result<Option<Command>, StreamError> {
        if let Some(code) = map.get("code").and_then(codes::parse_code) {
            return self.on_code(code, message(map));
        }
        match map.get("version").and_then(Value::as_u64) {
            Some(PROTOCOL_VERSION) => info!("[dispatch] server protocol v{PROTOCOL_VERSION}"),
            Some(v) => warn!("[dispatch] server speaks protocol v{v}, client expects v{PROTOCOL_VERSION}"),
            None => {
                let frame = Value::Object(map.clone());
                debug!("[dispatch] info: {frame}");
            }
        }
        Ok(None)
    }

    fn on_pong(&mut self, map: &Map<String, Value>, ts: u64) {
        let cid = map.get("cid").and_then(Value::as_u64);
        match self.pings.answer(cid, ts) {
            Some((cid, rtt)) => debug!("[dispatch] pong cid={cid} rtt={rtt}us"),
            None => debug!("[dispatch] unsolicited pong cid={cid:?}"),
        }
    }

    /// Resolve a server code through the table.
    fn on_code(&mut self, code: u32, msg: String) -> Result<Option<Command>, StreamError> {
        match codes::classify(code) {
            Some(CodeAction::Action(cmd)) => {
                info!("[dispatch] server code {code} ({msg}) → {cmd:?}");
                Ok(Some(cmd))
            }
            Some(CodeAction::Recoverable(signal)) => Err(StreamError::Server { code, signal, fatal: false, msg }),
            Some(CodeAction::Fatal(signal)) => Err(StreamError::Server { code, signal, fatal: true, msg }),
            None => Err(StreamError::UnknownServerCode { code, msg }),
        }
    }

    // -----------------------------------------------------------------------
    // Data plane
    // -----------------------------------------------------------------------

    fn on_data(&mut self, items: &[Value], ts: u64) -> Result<(), StreamError> {
        let id = items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| StreamError::MalformedPayload("data frame without channel id".into()))?;
        let rest = &items[1..];
        if rest.is_empty() {
            return Err(StreamError::MalformedPayload(format!("empty data frame for channel {id}")));
        }

        let record = {
            let mut registry = self.registry();
            let channel = registry.touch(id, ts)?;
            if rest[0].as_str() == Some(HEARTBEAT) {
                return Ok(());
            }

            let (topic, payload) = match channel.label.kind {
                ChannelKind::Account => {
                    let tag = rest[0].as_str().ok_or_else(|| {
                        StreamError::MalformedPayload(format!("account frame without event tag: {}", rest[0]))
                    })?;
                    let event = AccountEvent::from_tag(tag)?;
                    (event.topic(), rest.get(1).cloned().unwrap_or(Value::Null))
                }
                kind => (kind.topic(), payload_of(rest)),
            };

            OutputRecord { topic: topic.to_string(), pair: channel.label.pair(), payload, received_at_us: ts }
        };

        self.output.push(record);
        Ok(())
    }
}

/// The single remaining element, or all of them as an array.
fn payload_of(rest: &[Value]) -> Value {
    match rest {
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

fn chan_id(map: &Map<String, Value>) -> Option<ChannelId> {
    map.get("chanId").and_then(Value::as_i64)
}

fn required_chan_id(map: &Map<String, Value>) -> Result<ChannelId, StreamError> {
    chan_id(map).ok_or_else(|| StreamError::MalformedPayload(format!("ack without chanId: {}", Value::Object(map.clone()))))
}

fn status_ok(map: &Map<String, Value>) -> bool {
    map.get("status").and_then(Value::as_str).is_none_or(|s| s == "OK")
}

fn message(map: &Map<String, Value>) -> String {
    map.get("msg").and_then(Value::as_str).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::ServerSignal;
    use crate::output::{OutputReceiver, output_queue};
    use serde_json::json;

    const SEC: u64 = 1_000_000;
    const T0: u64 = 1_700_000_000 * SEC;

    fn setup() -> (Dispatcher, Arc<Mutex<ChannelRegistry>>, OutputReceiver) {
        let registry = Arc::new(Mutex::new(ChannelRegistry::new(Duration::from_secs(10))));
        let (out, rx) = output_queue();
        let pings = Arc::new(PingTracker::default());
        (Dispatcher::new(Arc::clone(&registry), out, pings, Duration::from_secs(10)), registry, rx)
    }

    fn msg(v: Value, ts: u64) -> InboundMessage {
        InboundMessage { received_at_us: ts, frame: Frame::decode(&v.to_string()).unwrap() }
    }

    fn subscribe_ticker(d: &mut Dispatcher, id: i64) {
        let ack = json!({"event": "subscribed", "channel": "ticker", "chanId": id,
                         "symbol": "tBTCUSD", "pair": "BTCUSD"});
        d.dispatch(&msg(ack, T0)).unwrap();
    }

    #[test]
    fn subscribed_ack_registers_once() {
        let (mut d, registry, _rx) = setup();
        subscribe_ticker(&mut d, 42);

        let dup = json!({"event": "subscribed", "channel": "trades", "chanId": 42, "symbol": "tETHUSD"});
        let err = d.dispatch(&msg(dup, T0 + SEC)).unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRegistered(42)));

        let registry = registry.lock().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(42).unwrap().label.kind, ChannelKind::Ticker);
    }

    #[test]
    fn ack_binds_the_request_it_answers() {
        let (mut d, registry, _rx) = setup();
        let req = crate::frame::SubscriptionRequest::book("tBTCUSD", "P0", "100");
        registry.lock().unwrap().expect_ack(req.clone());

        let ack = json!({"event": "subscribed", "channel": "book", "chanId": 8, "symbol": "tBTCUSD",
                         "pair": "BTCUSD", "prec": "P0", "freq": "F0", "len": "100"});
        d.dispatch(&msg(ack, T0)).unwrap();

        let r = registry.lock().unwrap();
        assert_eq!(r.pending_acks(), 0);
        assert_eq!(r.replay_set(), vec![req]);
    }

    #[test]
    fn rejected_conf_and_bare_info_only_log() {
        let (mut d, _registry, _rx) = setup();
        let cmd = d.dispatch(&msg(json!({"event": "conf", "status": "FAILED", "flags": 32768}), T0)).unwrap();
        assert_eq!(cmd, None);
        let cmd = d.dispatch(&msg(json!({"event": "info", "platform": {"status": 1}}), T0)).unwrap();
        assert_eq!(cmd, None);
    }

    #[test]
    fn unsubscribed_ack_removes_channel() {
        let (mut d, registry, _rx) = setup();
        subscribe_ticker(&mut d, 42);
        d.dispatch(&msg(json!({"event": "unsubscribed", "status": "OK", "chanId": 42}), T0)).unwrap();
        let r = registry.lock().unwrap();
        assert!(!r.contains(42));
        assert!(!r.heartbeats().is_tracked(42));
    }

    #[test]
    fn unsubscribed_ack_for_unknown_id_raises() {
        let (mut d, registry, _rx) = setup();
        subscribe_ticker(&mut d, 42);
        let err = d.dispatch(&msg(json!({"event": "unsubscribed", "chanId": 43}), T0)).unwrap_err();
        assert!(matches!(err, StreamError::NotRegistered(43)));
        assert_eq!(registry.lock().unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_frame_emits_nothing() {
        let (mut d, registry, rx) = setup();
        subscribe_ticker(&mut d, 42);
        d.dispatch(&msg(json!([42, "hb"]), T0 + 5 * SEC)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.lock().unwrap().heartbeats().last_seen(42), Some(T0 + 5 * SEC));
    }

    #[test]
    fn data_frame_emits_one_record() {
        let (mut d, registry, rx) = setup();
        subscribe_ticker(&mut d, 42);
        let payload = json!([7000.1, 1.5, 7000.2, 2.0, 10.0, 0.01, 7000.15, 1200.0, 7100.0, 6900.0]);
        d.dispatch(&msg(json!([42, payload.clone()]), T0 + 2 * SEC)).unwrap();

        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.topic, "ticker");
        assert_eq!(rec.pair, "BTCUSD");
        assert_eq!(rec.payload, payload);
        assert_eq!(rec.received_at_us, T0 + 2 * SEC);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.lock().unwrap().heartbeats().last_seen(42), Some(T0 + 2 * SEC));
    }

    #[test]
    fn unroutable_data_raises() {
        let (mut d, _registry, rx) = setup();
        let err = d.dispatch(&msg(json!([99, [1, 2, 3]]), T0)).unwrap_err();
        assert!(matches!(err, StreamError::NotRegistered(99)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn raw_book_records_use_raw_topic() {
        let (mut d, _registry, rx) = setup();
        let ack = json!({"event": "subscribed", "channel": "book", "chanId": 5,
                         "symbol": "tBTCUSD", "prec": "R0", "len": "25"});
        d.dispatch(&msg(ack, T0)).unwrap();
        d.dispatch(&msg(json!([5, [[123, 7000.0, 0.5]]]), T0)).unwrap();
        assert_eq!(rx.try_recv().unwrap().topic, "raw_order_book");
    }

    #[test]
    fn account_stream_uses_nested_table() {
        let (mut d, _registry, rx) = setup();
        d.dispatch(&msg(json!({"event": "auth", "status": "OK", "chanId": 0, "userId": 7}), T0)).unwrap();

        d.dispatch(&msg(json!([0, "wu", ["exchange", "USD", 100.0]]), T0)).unwrap();
        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.topic, "account_wallet");
        assert_eq!(rec.payload, json!(["exchange", "USD", 100.0]));

        let err = d.dispatch(&msg(json!([0, "zz", []]), T0)).unwrap_err();
        assert!(matches!(err, StreamError::UnknownAccountEvent(t) if t == "zz"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn auth_failure_reports_server_signal() {
        let (mut d, registry, _rx) = setup();
        let err = d
            .dispatch(&msg(json!({"event": "auth", "status": "FAILED", "chanId": 0, "code": 10100, "msg": "apikey: invalid"}), T0))
            .unwrap_err();
        assert!(matches!(err, StreamError::Server { signal: ServerSignal::AuthFailed, fatal: false, .. }));
        assert!(registry.lock().unwrap().is_empty());
    }

    #[test]
    fn auth_failure_drops_registered_account_stream() {
        let (mut d, registry, _rx) = setup();
        d.dispatch(&msg(json!({"event": "auth", "status": "OK", "chanId": 0, "userId": 7}), T0)).unwrap();
        assert!(registry.lock().unwrap().contains(0));

        let failed = json!({"event": "auth", "status": "FAILED", "chanId": 0, "msg": "nonce: small"});
        let err = d.dispatch(&msg(failed, T0 + SEC)).unwrap_err();
        assert!(matches!(err, StreamError::Server { code: 0, signal: ServerSignal::AuthFailed, .. }));
        assert!(!registry.lock().unwrap().contains(0));
    }

    #[test]
    fn unknown_error_code_is_not_swallowed() {
        let (mut d, _registry, _rx) = setup();
        let err = d.dispatch(&msg(json!({"event": "error", "code": "99999", "msg": "?"}), T0)).unwrap_err();
        assert!(matches!(err, StreamError::UnknownServerCode { code: 99999, .. }));
    }

    #[test]
    fn error_frame_without_code_is_malformed() {
        let (mut d, _registry, _rx) = setup();
        let err = d.dispatch(&msg(json!({"event": "error", "msg": "boom"}), T0)).unwrap_err();
        assert!(matches!(err, StreamError::MalformedPayload(_)));
    }

    #[test]
    fn fatal_and_recoverable_codes() {
        let (mut d, _registry, _rx) = setup();
        let err = d.dispatch(&msg(json!({"event": "error", "code": 10000, "msg": "Unknown event"}), T0)).unwrap_err();
        assert!(err.is_fatal());
        let err = d.dispatch(&msg(json!({"event": "error", "code": 10301, "msg": "subscribe: dup"}), T0)).unwrap_err();
        assert!(matches!(err, StreamError::Server { signal: ServerSignal::AlreadySubscribed, fatal: false, .. }));
    }

    #[test]
    fn info_codes_yield_commands() {
        let (mut d, _registry, _rx) = setup();
        let cmd = d.dispatch(&msg(json!({"event": "info", "code": 20051, "msg": "reconnect"}), T0)).unwrap();
        assert_eq!(cmd, Some(Command::Restart { soft: true }));
        let cmd = d.dispatch(&msg(json!({"event": "info", "code": 20060}), T0)).unwrap();
        assert_eq!(cmd, Some(Command::Pause));
        let cmd = d.dispatch(&msg(json!({"event": "info", "code": 20061}), T0)).unwrap();
        assert_eq!(cmd, Some(Command::Unpause));
        let cmd = d.dispatch(&msg(json!({"event": "info", "version": 2}), T0)).unwrap();
        assert_eq!(cmd, None);
    }

    #[test]
    fn unknown_event_is_fatal() {
        let (mut d, _registry, _rx) = setup();
        let err = d.dispatch(&msg(json!({"event": "mystery"}), T0)).unwrap_err();
        assert!(matches!(err, StreamError::UnknownEvent(ref e) if e == "mystery"));
        assert!(err.is_fatal());
    }

    #[test]
    fn pong_clears_outstanding_ping() {
        let (mut d, _registry, _rx) = setup();
        let cid = d.start_ping(T0);
        assert!(d.ping_outstanding());
        assert!(!d.ping_overdue(T0 + 10 * SEC));
        assert!(d.ping_overdue(T0 + 11 * SEC));
        d.dispatch(&msg(json!({"event": "pong", "cid": cid, "ts": 1}), T0 + SEC)).unwrap();
        assert!(!d.ping_outstanding());
    }

    #[test]
    fn heartbeat_escalation_through_dispatcher() {
        let (mut d, _registry, _rx) = setup();
        subscribe_ticker(&mut d, 42);
        assert!(d.check_heartbeats(T0 + 10 * SEC).unwrap().needs_ping());
        assert!(!d.check_heartbeats(T0 + 10 * SEC + 1).unwrap().needs_ping());
        d.dispatch(&msg(json!([42, "hb"]), T0 + 11 * SEC)).unwrap();
        assert_eq!(d.check_heartbeats(T0 + 11 * SEC).unwrap().recovered, vec![42]);
    }
}
