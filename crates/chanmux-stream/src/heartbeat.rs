//! Per-channel liveness tracking.
//!
//! Every data frame (heartbeat marker or payload) refreshes its channel's
//! last-seen stamp. [`HeartbeatMonitor::check`] compares those stamps with the
//! cycle time and maintains the late set: a channel is escalated once per
//! episode and logged again only when it recovers.
//!
//! # Thread safety
//!
//! Not thread-safe. Only the processor thread mutates it, through the
//! registry lock.

use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use chanmux_core::time_util;
use tracing::{info, warn};

use crate::error::StreamError;
use crate::registry::ChannelId;

/// Changes to the late set produced by one check.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Channels that crossed the threshold during this check.
    pub escalated: Vec<ChannelId>,
    /// Channels that left the late set during this check.
    pub recovered: Vec<ChannelId>,
}

impl HeartbeatReport {
    /// A channel went late; the caller should ping the server.
    pub fn needs_ping(&self) -> bool {
        !self.escalated.is_empty()
    }
}

pub struct HeartbeatMonitor {
    threshold_us: u64,
    last_seen: AHashMap<ChannelId, u64>,
    late: AHashSet<ChannelId>,
}

impl HeartbeatMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold_us: time_util::duration_us(threshold),
            last_seen: AHashMap::new(),
            late: AHashSet::new(),
        }
    }

    /// Refresh a channel's stamp. Stamps never move backwards.
    #[inline]
    pub fn record(&mut self, id: ChannelId, at_us: u64) {
        let entry = self.last_seen.entry(id).or_insert(at_us);
        *entry = (*entry).max(at_us);
    }

    /// Drop all state for a channel.
    pub fn forget(&mut self, id: ChannelId) {
        self.last_seen.remove(&id);
        self.late.remove(&id);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
        self.late.clear();
    }

    pub fn last_seen(&self, id: ChannelId) -> Option<u64> {
        self.last_seen.get(&id).copied()
    }

    pub fn is_tracked(&self, id: ChannelId) -> bool {
        self.last_seen.contains_key(&id)
    }

    pub fn is_late(&self, id: ChannelId) -> bool {
        self.late.contains(&id)
    }

    pub fn late_count(&self) -> usize {
        self.late.len()
    }

    /// Check every id in `ids` against the threshold at time `now_us`.
    ///
    /// An id with no stamp means the registry and this monitor disagree,
    /// which is reported as [`StreamError::HeartbeatMissing`].
    pub fn check(
        &mut self,
        ids: impl IntoIterator<Item = ChannelId>,
        now_us: u64,
    ) -> Result<HeartbeatReport, StreamError> {
        let mut report = HeartbeatReport::default();

        for id in ids {
            let last = self.last_seen(id).ok_or(StreamError::HeartbeatMissing(id))?;
            let age = time_util::elapsed_us(last, now_us);

            if age >= self.threshold_us {
                if self.late.insert(id) {
                    warn!("[heartbeat] channel {id} silent for {:.1}s", age as f64 / 1e6);
                    report.escalated.push(id);
                }
            } else if self.late.remove(&id) {
                info!("[heartbeat] channel {id} recovered");
                report.recovered.push(id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000;
    const T0: u64 = 1_700_000_000 * SEC;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(10))
    }

    #[test]
    fn escalates_once_then_recovers() {
        let mut m = monitor();
        m.record(42, T0);

        assert_eq!(m.check([42], T0 + 9 * SEC).unwrap(), HeartbeatReport::default());

        let r = m.check([42], T0 + 10 * SEC).unwrap();
        assert_eq!(r.escalated, vec![42]);
        assert!(r.needs_ping());
        assert!(m.is_late(42));

        // Still late: no second escalation.
        let r = m.check([42], T0 + 10 * SEC + 500_000).unwrap();
        assert!(r.escalated.is_empty());
        assert_eq!(m.late_count(), 1);

        m.record(42, T0 + 11 * SEC);
        let r = m.check([42], T0 + 11 * SEC).unwrap();
        assert_eq!(r.recovered, vec![42]);
        assert!(!m.is_late(42));
    }

    #[test]
    fn missing_stamp_is_an_error() {
        let mut m = monitor();
        m.record(1, T0);
        assert!(matches!(m.check([1, 2], T0), Err(StreamError::HeartbeatMissing(2))));
    }

    #[test]
    fn stamps_do_not_move_backwards() {
        let mut m = monitor();
        m.record(5, T0 + SEC);
        m.record(5, T0);
        assert_eq!(m.last_seen(5), Some(T0 + SEC));
    }

    #[test]
    fn forget_clears_late_state() {
        let mut m = monitor();
        m.record(5, T0);
        m.check([5], T0 + 20 * SEC).unwrap();
        m.forget(5);
        assert!(!m.is_late(5));
        assert!(!m.is_tracked(5));
    }
}
