//! Pub/sub transport contract
//!
//! A transport hands out named channels. Each channel supports ephemeral
//! broadcast to the other subscribers and presence tracking: every subscriber
//! may publish one small [`PresenceState`] blob, and the channel delivers a
//! synchronized [`PresenceSnapshot`] of all current blobs whenever it changes.

use crate::error::Result;
use crate::types::PresenceState;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// All currently tracked presence blobs, grouped by presence key. A key with
/// several sessions (e.g. two open tabs) has several entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    entries: BTreeMap<String, Vec<PresenceState>>,
}

impl PresenceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, state: PresenceState) {
        self.entries.entry(key.into()).or_default().push(state);
    }

    pub fn get(&self, key: &str) -> &[PresenceState] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PresenceState])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One entry per key, taken from its first session.
    pub fn members(&self) -> Vec<PresenceState> {
        self.entries
            .values()
            .filter_map(|states| states.first().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Ephemeral message from another subscriber
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// Full presence state after any change
    PresenceSync(PresenceSnapshot),
    PresenceJoin {
        key: String,
        states: Vec<PresenceState>,
    },
    PresenceLeave {
        key: String,
        states: Vec<PresenceState>,
    },
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Send to every other current subscriber. Not echoed to the sender.
    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<()>;

    /// Publish or replace this subscriber's presence blob.
    async fn track(&self, state: PresenceState) -> Result<()>;

    /// Retract this subscriber's presence blob.
    async fn untrack(&self) -> Result<()>;

    async fn presence_state(&self) -> PresenceSnapshot;

    /// Leave the channel. Presence held by this subscriber disappears.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Handle returned by [`Transport::subscribe`]: the channel plus the stream of
/// events delivered to this subscriber.
pub struct Subscription {
    pub channel: Arc<dyn Channel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Subscription {
    /// Retract presence, then leave the channel.
    pub async fn close(self) -> Result<()> {
        release(self.channel.as_ref()).await
    }
}

/// Retract presence and unsubscribe, reporting the first failure.
pub async fn release(channel: &dyn Channel) -> Result<()> {
    let untracked = channel.untrack().await;
    channel.unsubscribe().await?;
    untracked
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Join `topic`, tracking presence under `presence_key`.
    async fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Subscription>;
}
