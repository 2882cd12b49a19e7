//! The output queue: the client's only product.
//!
//! Records are moved into an unbounded crossbeam channel, so nothing is
//! shared once pushed. The receiving half is cloneable: several consumers
//! may poll it with standard queue semantics (each record goes to one of
//! them).

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use tracing::warn;

/// A normalized record, independent of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    /// `ticker`, `order_book`, `raw_order_book`, `ohlc`, `trades` or `account_*`.
    pub topic: String,
    /// Instrument from the channel label; empty for account records.
    pub pair: String,
    /// Kind-specific payload, passed through untouched.
    pub payload: Value,
    /// Receipt time of the frame, microseconds since epoch.
    pub received_at_us: u64,
}

/// Consumer half handed to downstream code.
pub type OutputReceiver = Receiver<OutputRecord>;

/// Producer half used by the processor.
#[derive(Clone)]
pub struct OutputQueue {
    tx: Sender<OutputRecord>,
}

/// Create a connected output queue pair.
pub fn output_queue() -> (OutputQueue, OutputReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (OutputQueue { tx }, rx)
}

impl OutputQueue {
    /// Push a record. If every consumer is gone the record is dropped.
    pub fn push(&self, record: OutputRecord) {
        if self.tx.send(record).is_err() {
            warn!("[output] no consumers left, record dropped");
        }
    }
}
