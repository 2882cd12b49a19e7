//! Processor loop: drains the inbound queue through the dispatcher.
//!
//! Each cycle: wait for the processor gate, check ping and connection
//! liveness, pop one message with a bounded wait, dispatch it, then run the
//! heartbeat check at the cycle timestamp (the message's receipt time, or
//! now when the queue was empty). A bad frame never ends the loop; fatal
//! faults become a `Stop` command.

use std::sync::Arc;
use std::time::Duration;

use chanmux_core::time_util;
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::dispatch::Dispatcher;
use crate::error::StreamError;
use crate::frame::{InboundMessage, build_ping};
use crate::heartbeat::HeartbeatReport;
use crate::shared::Shared;

const GATE_POLL: Duration = Duration::from_millis(50);

pub(crate) fn run_processor_loop(shared: Arc<Shared>, epoch: u64, mut dispatcher: Dispatcher, queue_timeout: Duration) {
    info!("[processor] started (epoch {epoch})");
    let mut dispatched: u64 = 0;

    while shared.keep_running(epoch) {
        if !shared.processor_gate.wait_open(GATE_POLL) {
            continue;
        }

        // While ingestion is paused nothing can answer a ping or refresh a
        // heartbeat, so liveness is not judged.
        let ingesting = shared.receiver_gate.is_open();

        if ingesting && dispatcher.ping_overdue(time_util::now_us()) {
            dispatcher.clear_ping();
            shared.connection_lost("processor", "ping unanswered");
        } else if !shared.is_connected() {
            shared.request("processor", Command::Restart { soft: true });
        }

        let cycle_ts = match shared.inbound_rx.recv_timeout(queue_timeout) {
            Ok(msg) => {
                dispatched += 1;
                handle_message(&shared, &mut dispatcher, &msg);
                msg.received_at_us
            }
            Err(RecvTimeoutError::Timeout) => time_util::now_us(),
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if ingesting {
            match dispatcher.check_heartbeats(cycle_ts) {
                Ok(report) => maybe_ping(&shared, &dispatcher, &report, cycle_ts),
                Err(e) => fault(&shared, &e, "heartbeat check"),
            }
        }
    }

    info!("[processor] stopped after {dispatched} frames");
}

fn handle_message(shared: &Shared, dispatcher: &mut Dispatcher, msg: &InboundMessage) {
    match dispatcher.dispatch(msg) {
        Ok(Some(cmd)) => shared.request("processor", cmd),
        Ok(None) => {}
        Err(e) => fault(shared, &e, &format!("{:?}", msg.frame)),
    }
}

/// Log a dispatch fault with its context; fatal ones stop the client.
fn fault(shared: &Shared, e: &StreamError, context: &str) {
    match e {
        _ if e.is_fatal() => {
            error!("[processor] fatal: {e} | {context}");
            shared.request("processor", Command::Stop);
        }
        StreamError::UnknownServerCode { .. } => error!("[processor] {e} | {context}"),
        StreamError::Transport(_) => shared.connection_lost("processor", &e.to_string()),
        _ => warn!("[processor] {e} | {context}"),
    }
}

/// Send one ping when a channel newly went silent and none is outstanding.
fn maybe_ping(shared: &Shared, dispatcher: &Dispatcher, report: &HeartbeatReport, now_us: u64) {
    if !report.needs_ping() || dispatcher.ping_outstanding() {
        return;
    }
    let cid = dispatcher.start_ping(now_us);
    debug!("[processor] late channels {:?}, sending ping cid={cid}", report.escalated);
    if let Err(e) = shared.send(build_ping(cid)) {
        dispatcher.clear_ping();
        debug!("[processor] ping not sent: {e}");
    }
}
