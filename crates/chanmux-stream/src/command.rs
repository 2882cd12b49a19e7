//! Controller commands and the queue that carries them.
//!
//! Commands are produced by the processor (server codes, fatal faults,
//! connection loss), the receiver (socket closed) and external callers, and
//! consumed exactly once by the controller thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::error::StreamError;

/// A lifecycle operation for the controller to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Restart { soft: bool },
    Stop,
    Pause,
    Unpause,
}

/// Producer side of the command queue.
///
/// Restart requests are coalesced: while one is queued and not yet finished,
/// further restart requests are dropped. The receiver and the processor both
/// notice a lost connection, so without this one loss would restart twice.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<Command>,
    restart_pending: Arc<AtomicBool>,
}

/// Consumer side of the command queue, owned by the controller.
pub struct CommandReceiver {
    rx: Receiver<Command>,
    restart_pending: Arc<AtomicBool>,
}

/// Create a connected command queue pair.
pub fn command_queue() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let pending = Arc::new(AtomicBool::new(false));
    (
        CommandQueue { tx, restart_pending: Arc::clone(&pending) },
        CommandReceiver { rx, restart_pending: pending },
    )
}

impl CommandQueue {
    /// Enqueue a command without blocking.
    pub fn push(&self, cmd: Command) -> Result<(), StreamError> {
        if let Command::Restart { .. } = cmd {
            if self.restart_pending.swap(true, Ordering::AcqRel) {
                debug!("[commands] restart already pending, dropping {cmd:?}");
                return Ok(());
            }
        }
        self.tx.send(cmd).map_err(|_| StreamError::ControllerGone)
    }

    /// Whether a restart is queued or running.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::Acquire)
    }
}

impl CommandReceiver {
    /// Wait up to `timeout` for the next command.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Command, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Mark the pending restart as finished so new ones are accepted.
    pub fn restart_done(&self) {
        self.restart_pending.store(false, Ordering::Release);
    }
}
