//! Channel registry: id to handler/label binding plus liveness state.
//!
//! Entries are created from server acks and removed on `unsubscribed` acks
//! or when the connection stops. The registry never overwrites: a second ack
//! for a registered id is rejected, since that means the registry has
//! drifted from the server's view.

use std::time::Duration;

use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::channel::ChannelLabel;
use crate::error::StreamError;
use crate::frame::SubscriptionRequest;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatReport};

/// Server-assigned channel id.
pub type ChannelId = i64;

/// A registered channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub label: ChannelLabel,
    pub subscribed_at_us: u64,
}

pub struct ChannelRegistry {
    channels: AHashMap<ChannelId, Channel>,
    heartbeats: HeartbeatMonitor,
    /// Requests sent but not yet acked, oldest first.
    pending: Vec<SubscriptionRequest>,
}

impl ChannelRegistry {
    /// Create an empty registry whose channels go late after `heartbeat_timeout`.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self { channels: AHashMap::new(), heartbeats: HeartbeatMonitor::new(heartbeat_timeout), pending: Vec::new() }
    }

    /// Remember a sent `subscribe` until its ack arrives.
    pub fn expect_ack(&mut self, req: SubscriptionRequest) {
        self.pending.push(req);
    }

    /// Take the oldest pending request for `channel` that the ack does not
    /// contradict. Keys missing from the ack count as agreeing.
    pub fn claim_request(&mut self, channel: &str, ack: &Map<String, Value>) -> Option<SubscriptionRequest> {
        let pos = self.pending.iter().position(|req| {
            req.channel == channel && req.params.iter().all(|(k, v)| ack.get(k).is_none_or(|echoed| echoed == v))
        })?;
        Some(self.pending.remove(pos))
    }

    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Bind `id` to `label` and start its heartbeat clock at `at_us`.
    pub fn register(&mut self, id: ChannelId, label: ChannelLabel, at_us: u64) -> Result<(), StreamError> {
        if self.channels.contains_key(&id) {
            return Err(StreamError::AlreadyRegistered(id));
        }
        self.heartbeats.record(id, at_us);
        self.channels.insert(id, Channel { id, label, subscribed_at_us: at_us });
        Ok(())
    }

    /// Remove `id` from the registry and the heartbeat state.
    pub fn deregister(&mut self, id: ChannelId) -> Result<Channel, StreamError> {
        let channel = self.channels.remove(&id).ok_or(StreamError::NotRegistered(id))?;
        self.heartbeats.forget(id);
        Ok(channel)
    }

    /// Refresh the heartbeat of a registered channel and return it.
    pub fn touch(&mut self, id: ChannelId, at_us: u64) -> Result<&Channel, StreamError> {
        let channel = self.channels.get(&id).ok_or(StreamError::NotRegistered(id))?;
        self.heartbeats.record(id, at_us);
        Ok(channel)
    }

    /// Run the liveness check over every registered channel.
    pub fn check_heartbeats(&mut self, now_us: u64) -> Result<HeartbeatReport, StreamError> {
        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        self.heartbeats.check(ids, now_us)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn heartbeats(&self) -> &HeartbeatMonitor {
        &self.heartbeats
    }

    /// Copy of every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<Channel> {
        let mut all: Vec<Channel> = self.channels.values().cloned().collect();
        all.sort_unstable_by_key(|c| c.id);
        all
    }

    /// Subscriptions to resend after a reconnect, ordered by id.
    pub fn replay_set(&self) -> Vec<SubscriptionRequest> {
        self.snapshot()
            .into_iter()
            .map(|c| c.label)
            .filter(ChannelLabel::is_replayable)
            .map(|l| SubscriptionRequest::new(l.channel, l.subscription))
            .collect()
    }

    /// Forget every channel and pending request.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.heartbeats.clear();
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn heartbeats_mut(&mut self) -> &mut HeartbeatMonitor {
        &mut self.heartbeats
    }
}
