//! Controller: executes lifecycle commands off the worker threads.
//!
//! Workers and error handlers only enqueue [`Command`]s; this thread runs
//! the matching [`ConnectionManager`] operation. A restart that cannot
//! reconnect is retried with exponential backoff until it succeeds, the
//! client is stopped, or the client shuts down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info};

use crate::client::ConnectionManager;
use crate::command::{Command, CommandReceiver};

const POLL: Duration = Duration::from_millis(50);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) fn run_controller_loop(manager: Arc<ConnectionManager>, commands: CommandReceiver) {
    info!("[controller] started");

    while !manager.is_shut_down() {
        let cmd = match commands.recv_timeout(POLL) {
            Ok(cmd) => cmd,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        debug!("[controller] executing {cmd:?}");

        match cmd {
            Command::Restart { soft } => {
                restart_with_backoff(&manager, soft);
                commands.restart_done();
            }
            Command::Stop => manager.stop(),
            Command::Pause => manager.pause(),
            Command::Unpause => manager.unpause(),
        }
    }

    info!("[controller] stopped");
}

fn restart_with_backoff(manager: &ConnectionManager, soft: bool) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if !manager.wants_running() {
            info!("[controller] client stopped, restart dropped");
            return;
        }
        match manager.restart(soft) {
            Ok(()) => return,
            Err(e) => error!("[controller] restart failed: {e}, retrying in {backoff:?}"),
        }
        if !sleep_unless_shut_down(manager, backoff) {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Sleep for `d` in short slices; `false` if the client shut down meanwhile.
fn sleep_unless_shut_down(manager: &ConnectionManager, d: Duration) -> bool {
    let deadline = Instant::now() + d;
    while Instant::now() < deadline {
        if manager.is_shut_down() {
            return false;
        }
        std::thread::sleep(POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
    !manager.is_shut_down()
}
