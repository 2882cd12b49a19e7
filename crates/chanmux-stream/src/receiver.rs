//! Receiver loop: the only thread that touches the socket.
//!
//! Each cycle: wait for the receiver gate, write queued outbound frames,
//! then one read bounded by the socket's read timeout. Text frames are
//! stamped, decoded and pushed on the inbound queue. A socket whose
//! connection was declared lost elsewhere is closed and cleared here.

use std::sync::Arc;
use std::time::Duration;

use chanmux_core::time_util;
use tracing::{debug, info, warn};

use crate::frame::{Frame, InboundMessage};
use crate::shared::Shared;
use crate::transport::{Socket, TransportError};

/// How long one gate wait may block before the run flag is rechecked.
const GATE_POLL: Duration = Duration::from_millis(50);

/// Idle sleep while there is no socket.
const IDLE: Duration = Duration::from_millis(20);

pub(crate) fn run_receiver_loop(shared: Arc<Shared>, epoch: u64) {
    info!("[receiver] started (epoch {epoch})");
    let mut received: u64 = 0;

    while shared.keep_running(epoch) {
        if !shared.receiver_gate.wait_open(GATE_POLL) {
            continue;
        }

        let text = {
            let mut slot = shared.socket();
            if !shared.is_connected() {
                if let Some(mut dead) = slot.take() {
                    debug!("[receiver] closing socket of a lost connection");
                    dead.close();
                }
            }
            let Some(socket) = slot.as_deref_mut() else {
                drop(slot);
                std::thread::sleep(IDLE);
                continue;
            };

            match read_cycle(socket, &shared) {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    if let Some(mut dead) = slot.take() {
                        dead.close();
                    }
                    drop(slot);
                    shared.connection_lost("receiver", &e.to_string());
                    continue;
                }
            }
        };

        let received_at_us = time_util::now_us();
        match Frame::decode(&text) {
            Ok(frame) => {
                received += 1;
                if shared.inbound_tx.send(InboundMessage { received_at_us, frame }).is_err() {
                    warn!("[receiver] inbound queue closed");
                    break;
                }
            }
            Err(e) => warn!("[receiver] dropping undecodable frame: {e}"),
        }
    }

    info!("[receiver] stopped after {received} frames");
}

/// Write every queued outbound frame in order, then read once.
fn read_cycle(socket: &mut dyn Socket, shared: &Shared) -> Result<Option<String>, TransportError> {
    for text in shared.outbound_rx.try_iter() {
        debug!("[receiver] → {text}");
        socket.send_text(&text)?;
    }
    socket.recv_text()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, command_queue};
    use crate::registry::ChannelRegistry;
    use crate::transport::Connector;
    use crate::transport::mock::MockHub;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn lost_connection_socket_is_cleared() {
        let hub = MockHub::new();
        let (commands, command_rx) = command_queue();
        let shared = Arc::new(Shared::new(ChannelRegistry::new(Duration::from_secs(10)), commands));
        shared.attach(hub.connector().connect(WAIT, Duration::from_millis(10)).unwrap());
        let epoch = shared.begin();
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || run_receiver_loop(shared, epoch))
        };

        shared.connection_lost("processor", "ping unanswered");
        assert!(hub.wait_until(WAIT, |h| h.closed_by_client(0)));
        assert!(shared.socket().is_none());
        assert_eq!(command_rx.recv_timeout(WAIT), Ok(Command::Restart { soft: true }));

        shared.halt();
        worker.join().unwrap();
    }
}
