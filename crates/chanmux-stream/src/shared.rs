//! State shared between the connection manager and its worker threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use crate::command::{Command, CommandQueue};
use crate::dispatch::PingTracker;
use crate::error::StreamError;
use crate::frame::{InboundMessage, SubscriptionRequest};
use crate::gate::PauseGate;
use crate::registry::ChannelRegistry;
use crate::transport::Socket;

pub(crate) type SocketSlot = Option<Box<dyn Socket>>;

pub(crate) struct Shared {
    running: AtomicBool,
    /// Bumped by every `stop()`; workers of an older epoch exit even if a
    /// later `start()` has set `running` again.
    epoch: AtomicU64,
    connected: AtomicBool,
    socket: Mutex<SocketSlot>,

    pub(crate) receiver_gate: PauseGate,
    pub(crate) processor_gate: PauseGate,
    pub(crate) registry: Arc<Mutex<ChannelRegistry>>,
    pub(crate) pings: Arc<PingTracker>,
    pub(crate) commands: CommandQueue,

    pub(crate) inbound_tx: Sender<InboundMessage>,
    pub(crate) inbound_rx: Receiver<InboundMessage>,
    pub(crate) outbound_tx: Sender<String>,
    pub(crate) outbound_rx: Receiver<String>,
}

impl Shared {
    pub(crate) fn new(registry: ChannelRegistry, commands: CommandQueue) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        Self {
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            socket: Mutex::new(None),
            receiver_gate: PauseGate::new(),
            processor_gate: PauseGate::new(),
            registry: Arc::new(Mutex::new(registry)),
            pings: Arc::new(PingTracker::default()),
            commands,
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    // -----------------------------------------------------------------------
    // Run flags
    // -----------------------------------------------------------------------

    /// Mark the workers of the current epoch as running; returns that epoch.
    pub(crate) fn begin(&self) -> u64 {
        self.running.store(true, Ordering::Release);
        self.epoch.load(Ordering::Acquire)
    }

    /// Tell every worker to exit.
    pub(crate) fn halt(&self) {
        self.running.store(false, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn keep_running(&self, epoch: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.epoch.load(Ordering::Acquire) == epoch
    }

    // -----------------------------------------------------------------------
    // Socket slot
    // -----------------------------------------------------------------------

    pub(crate) fn socket(&self) -> MutexGuard<'_, SocketSlot> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The connected flag is only flipped under the slot lock, so the
    /// receiver never sees a fresh socket marked as lost.
    pub(crate) fn attach(&self, socket: Box<dyn Socket>) {
        let mut slot = self.socket();
        *slot = Some(socket);
        self.connected.store(true, Ordering::Release);
    }

    /// Close and drop the socket, if any.
    pub(crate) fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(mut socket) = self.socket().take() {
            socket.close();
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Mark the connection dead and ask the controller for a soft restart.
    /// The receiver closes and clears the socket on its next cycle.
    pub(crate) fn connection_lost(&self, who: &str, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("[{who}] connection lost: {reason}");
        }
        self.request(who, Command::Restart { soft: true });
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Queue an outbound frame; the receiver writes it before its next read.
    pub(crate) fn send(&self, text: String) -> Result<(), StreamError> {
        if !self.is_connected() {
            return Err(StreamError::NotConnected);
        }
        self.outbound_tx.send(text).map_err(|_| StreamError::NotConnected)
    }

    /// Queue a `subscribe` and remember it until the ack arrives. The
    /// registry lock is held across the send so the ack cannot be handled
    /// before the request is recorded.
    pub(crate) fn subscribe(&self, req: &SubscriptionRequest) -> Result<(), StreamError> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        self.send(req.to_frame())?;
        registry.expect_ack(req.clone());
        Ok(())
    }

    /// Hand a command to the controller, logging if it is gone.
    pub(crate) fn request(&self, who: &str, cmd: Command) {
        if let Err(e) = self.commands.push(cmd) {
            error!("[{who}] cannot queue {cmd:?}: {e}");
        }
    }

    /// Drop everything still queued in either direction.
    pub(crate) fn drain_queues(&self) -> (usize, usize) {
        let outbound = self.outbound_rx.try_iter().count();
        let inbound = self.inbound_rx.try_iter().count();
        (outbound, inbound)
    }
}
