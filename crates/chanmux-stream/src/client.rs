//! Connection manager and the public client handle.
//!
//! [`ConnectionManager`] owns the socket slot, the channel registry and the
//! worker threads, and serializes lifecycle transitions behind one lock:
//!
//! ```text
//!            start()                 pause()
//! Stopped ─────────► Connecting ──► Running ⇄ Paused
//!    ▲                   │             │ unpause()
//!    │  connect failed   │             │ restart(soft)
//!    └───────────────────┘             ▼
//!    ◄────────── stop() ────────── Restarting ──► stop() ──► start()
//! ```
//!
//! [`StreamClient`] wraps the manager with the controller thread, the
//! subscription API and the output queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chanmux_core::time_util;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandQueue, CommandReceiver, command_queue};
use crate::config::ClientConfig;
use crate::controller::run_controller_loop;
use crate::dispatch::Dispatcher;
use crate::error::StreamError;
use crate::frame::{self, SubscriptionRequest};
use crate::output::{OutputQueue, OutputReceiver, output_queue};
use crate::processor::run_processor_loop;
use crate::receiver::run_receiver_loop;
use crate::registry::{Channel, ChannelId, ChannelRegistry};
use crate::shared::Shared;
use crate::transport::Connector;

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Running,
    Paused,
    Restarting,
}

struct Lifecycle {
    state: ConnectionState,
    receiver: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<()>>,
    /// Subscriptions to resend on the next successful start.
    replay: Option<Vec<SubscriptionRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>, StreamError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| StreamError::Worker(format!("{name}: {e}")))
}

fn is_alive(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

/// Join with a deadline; a worker that does not finish in time is detached.
fn join_bounded(handle: Option<JoinHandle<()>>, name: &str, timeout: Duration) {
    let Some(handle) = handle else { return };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("[client] {name} did not stop within {timeout:?}, detaching");
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        error!("[client] {name} panicked");
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Owns the connection and runs the lifecycle transitions.
pub struct ConnectionManager {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    shared: Arc<Shared>,
    output: OutputQueue,
    lifecycle: Mutex<Lifecycle>,
    /// Cleared by an explicit `stop()`; pending restarts are then dropped.
    wants_running: AtomicBool,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    fn new(config: ClientConfig, connector: Box<dyn Connector>, output: OutputQueue, commands: CommandQueue) -> Self {
        let registry = ChannelRegistry::new(config.heartbeat_timeout);
        Self {
            shared: Arc::new(Shared::new(registry, commands)),
            config,
            connector,
            output,
            lifecycle: Mutex::new(Lifecycle { state: ConnectionState::Stopped, receiver: None, processor: None, replay: None }),
            wants_running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    pub(crate) fn wants_running(&self) -> bool {
        self.wants_running.load(Ordering::Acquire)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Connect, spawn the workers and send the startup frames.
    /// A no-op while running or paused.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut lc = self.lifecycle();
        self.wants_running.store(true, Ordering::Release);
        self.start_locked(&mut lc)
    }

    fn start_locked(&self, lc: &mut Lifecycle) -> Result<(), StreamError> {
        if matches!(lc.state, ConnectionState::Running | ConnectionState::Paused) {
            debug!("[client] start ignored, already {:?}", lc.state);
            return Ok(());
        }

        lc.state = ConnectionState::Connecting;
        let socket = match self.connector.connect(self.config.connect_timeout, self.config.read_timeout) {
            Ok(s) => s,
            Err(e) => {
                lc.state = ConnectionState::Stopped;
                error!("[client] connect failed: {e}");
                return Err(e.into());
            }
        };
        self.shared.attach(socket);
        self.shared.receiver_gate.open();
        self.shared.processor_gate.open();
        let epoch = self.shared.begin();

        if let Err(e) = self.spawn_workers(lc, epoch) {
            self.shared.halt();
            self.shared.detach();
            lc.state = ConnectionState::Stopped;
            return Err(e);
        }

        lc.state = ConnectionState::Running;
        info!("[client] running (epoch {epoch})");

        if let Err(e) = self.send_startup(lc.replay.take()) {
            warn!("[client] startup frames not sent: {e}");
        }
        Ok(())
    }

    fn spawn_workers(&self, lc: &mut Lifecycle, epoch: u64) -> Result<(), StreamError> {
        if !is_alive(&lc.receiver) {
            let shared = Arc::clone(&self.shared);
            lc.receiver = Some(spawn_worker("chanmux-receiver", move || run_receiver_loop(shared, epoch))?);
        }
        if !is_alive(&lc.processor) {
            let shared = Arc::clone(&self.shared);
            let dispatcher = Dispatcher::new(
                Arc::clone(&shared.registry),
                self.output.clone(),
                Arc::clone(&shared.pings),
                self.config.ping_timeout,
            );
            let queue_timeout = self.config.queue_timeout;
            lc.processor = Some(spawn_worker("chanmux-processor", move || {
                run_processor_loop(shared, epoch, dispatcher, queue_timeout)
            })?);
        }
        Ok(())
    }

    /// `conf` flags, then `auth`, then the replay set or the configured
    /// subscriptions.
    fn send_startup(&self, replay: Option<Vec<SubscriptionRequest>>) -> Result<(), StreamError> {
        if let Some(flags) = self.config.conf_flags {
            self.shared.send(frame::build_conf(flags))?;
        }
        if let Some(creds) = &self.config.credentials {
            self.shared.send(frame::build_auth(&creds.api_key, &creds.api_secret, time_util::now_us())?)?;
        }
        let subscriptions = match &replay {
            Some(reqs) => {
                info!("[client] replaying {} channel(s)", reqs.len());
                reqs
            }
            None => &self.config.subscriptions,
        };
        for req in subscriptions {
            self.shared.subscribe(req)?;
        }
        Ok(())
    }

    /// Stop the workers and drop all connection state. Idempotent.
    pub fn stop(&self) {
        let mut lc = self.lifecycle();
        self.wants_running.store(false, Ordering::Release);
        self.stop_locked(&mut lc);
    }

    fn stop_locked(&self, lc: &mut Lifecycle) {
        if lc.state == ConnectionState::Stopped && lc.receiver.is_none() && lc.processor.is_none() {
            return;
        }
        info!("[client] stopping");

        self.shared.halt();
        self.shared.receiver_gate.open();
        self.shared.processor_gate.open();
        join_bounded(lc.receiver.take(), "receiver", self.config.join_timeout);
        join_bounded(lc.processor.take(), "processor", self.config.join_timeout);

        self.shared.detach();
        let (outbound, inbound) = self.shared.drain_queues();
        lock(&self.shared.registry).clear();
        self.shared.pings.clear();

        lc.state = ConnectionState::Stopped;
        info!("[client] stopped (dropped {outbound} outbound, {inbound} inbound)");
    }

    /// Stop then start. A soft restart resubscribes the public channels
    /// registered before the stop.
    pub fn restart(&self, soft: bool) -> Result<(), StreamError> {
        let mut lc = self.lifecycle();
        info!("[client] restart (soft={soft})");
        lc.state = ConnectionState::Restarting;

        if soft {
            // A failed reconnect leaves the registry empty; keep the set
            // captured by the first attempt.
            let replay = lock(&self.shared.registry).replay_set();
            if !replay.is_empty() {
                lc.replay = Some(replay);
            }
        } else {
            lc.replay = None;
        }

        self.stop_locked(&mut lc);
        self.start_locked(&mut lc)
    }

    /// Freeze socket reads without closing the connection.
    pub fn pause(&self) {
        let mut lc = self.lifecycle();
        if lc.state == ConnectionState::Running {
            self.shared.receiver_gate.close();
            lc.state = ConnectionState::Paused;
            info!("[client] paused");
        } else {
            debug!("[client] pause ignored in {:?}", lc.state);
        }
    }

    pub fn unpause(&self) {
        let mut lc = self.lifecycle();
        if lc.state == ConnectionState::Paused {
            self.shared.pings.clear();
            self.shared.receiver_gate.open();
            lc.state = ConnectionState::Running;
            info!("[client] resumed");
        } else {
            debug!("[client] unpause ignored in {:?}", lc.state);
        }
    }

    /// Hold the processor; frames keep queueing.
    pub fn pause_processing(&self) {
        if self.shared.processor_gate.close() {
            info!("[client] processing paused");
        }
    }

    pub fn resume_processing(&self) {
        if self.shared.processor_gate.open() {
            info!("[client] processing resumed");
        }
    }
}

// ---------------------------------------------------------------------------
// StreamClient
// ---------------------------------------------------------------------------

/// Multiplexed streaming client.
///
/// Records produced by every channel arrive on [`StreamClient::output`].
/// Dropping the client shuts it down.
pub struct StreamClient {
    manager: Arc<ConnectionManager>,
    commands: CommandQueue,
    command_rx: Mutex<Option<CommandReceiver>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    output_rx: OutputReceiver,
    join_timeout: Duration,
}

impl StreamClient {
    pub fn new(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        let (output, output_rx) = output_queue();
        let (commands, command_rx) = command_queue();
        let join_timeout = config.join_timeout;
        let manager = ConnectionManager::new(config, Box::new(connector), output, commands.clone());
        Self {
            manager: Arc::new(manager),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            controller: Mutex::new(None),
            output_rx,
            join_timeout,
        }
    }

    fn ensure_controller(&self) -> Result<(), StreamError> {
        let mut handle = lock(&self.controller);
        if is_alive(&handle) {
            return Ok(());
        }
        if self.manager.is_shut_down() {
            return Err(StreamError::ControllerGone);
        }
        let rx = lock(&self.command_rx).take().ok_or(StreamError::ControllerGone)?;
        let manager = Arc::clone(&self.manager);
        *handle = Some(spawn_worker("chanmux-controller", move || run_controller_loop(manager, rx))?);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn start(&self) -> Result<(), StreamError> {
        self.ensure_controller()?;
        self.manager.start()
    }

    pub fn stop(&self) {
        self.manager.stop();
    }

    pub fn restart(&self, soft: bool) -> Result<(), StreamError> {
        self.manager.restart(soft)
    }

    pub fn pause(&self) {
        self.manager.pause();
    }

    pub fn unpause(&self) {
        self.manager.unpause();
    }

    pub fn pause_processing(&self) {
        self.manager.pause_processing();
    }

    pub fn resume_processing(&self) {
        self.manager.resume_processing();
    }

    /// Queue a command for the controller instead of running it inline.
    pub fn command(&self, cmd: Command) -> Result<(), StreamError> {
        self.commands.push(cmd)
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Stop the client and its controller. The client cannot be restarted.
    pub fn shutdown(&self) {
        if self.manager.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.stop();
        join_bounded(lock(&self.controller).take(), "controller", self.join_timeout);
        info!("[client] shut down");
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Send `subscribe`; the channel is registered when the ack arrives.
    pub fn subscribe(&self, channel: &str, params: Map<String, Value>) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::new(channel, params))
    }

    pub fn subscribe_request(&self, req: &SubscriptionRequest) -> Result<(), StreamError> {
        self.manager.shared.subscribe(req)
    }

    pub fn subscribe_ticker(&self, symbol: &str) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::ticker(symbol))
    }

    pub fn subscribe_trades(&self, symbol: &str) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::trades(symbol))
    }

    pub fn subscribe_book(&self, symbol: &str, precision: &str, length: &str) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::book(symbol, precision, length))
    }

    pub fn subscribe_raw_book(&self, symbol: &str, length: &str) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::raw_book(symbol, length))
    }

    pub fn subscribe_candles(&self, symbol: &str, timeframe: &str) -> Result<(), StreamError> {
        self.subscribe_request(&SubscriptionRequest::candles(symbol, timeframe))
    }

    /// Send `unsubscribe` for a registered channel; it is removed when the
    /// ack arrives.
    pub fn unsubscribe(&self, chan_id: ChannelId) -> Result<(), StreamError> {
        if !lock(&self.manager.shared.registry).contains(chan_id) {
            return Err(StreamError::NotRegistered(chan_id));
        }
        self.manager.shared.send(frame::build_unsubscribe(chan_id))
    }

    /// Open the account stream.
    pub fn authenticate(&self, api_key: &str, api_secret: &str) -> Result<(), StreamError> {
        let auth = frame::build_auth(api_key, api_secret, time_util::now_us())?;
        self.manager.shared.send(auth)
    }

    pub fn configure(&self, flags: u64) -> Result<(), StreamError> {
        self.manager.shared.send(frame::build_conf(flags))
    }

    /// Ping the server; returns the `cid` the pong will carry.
    pub fn ping(&self) -> Result<u64, StreamError> {
        let pings = &self.manager.shared.pings;
        let cid = pings.start(time_util::now_us());
        self.manager.shared.send(frame::build_ping(cid)).inspect_err(|_| pings.clear())?;
        Ok(cid)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Registered channels, sorted by id. A copy; it goes stale immediately.
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.manager.shared.registry).snapshot()
    }

    /// A handle on the output queue. Clones share the same records.
    pub fn output(&self) -> OutputReceiver {
        self.output_rx.clone()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
