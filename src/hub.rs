//! In-process transport
//!
//! Routes channel traffic between subscribers living in the same process.
//! Each topic keeps its members with their event senders and presence blobs;
//! broadcasts fan out to every member but the sender, and every presence
//! change is followed by a full sync to all members, the changer included.
//! Dropping a channel handle counts as a disconnect.

use crate::error::{Result, SyncError};
use crate::transport::{Channel, ChannelEvent, PresenceSnapshot, Subscription, Transport};
use crate::types::PresenceState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Member {
    key: String,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    presence: Option<PresenceState>,
}

#[derive(Default)]
struct Topic {
    members: HashMap<u64, Member>,
}

impl Topic {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut ids: Vec<_> = self.members.keys().copied().collect();
        ids.sort_unstable();

        let mut snapshot = PresenceSnapshot::new();
        for id in ids {
            let member = &self.members[&id];
            if let Some(state) = &member.presence {
                snapshot.insert(member.key.clone(), state.clone());
            }
        }
        snapshot
    }

    fn send_all(&self, event: ChannelEvent) {
        for member in self.members.values() {
            let _ = member.tx.send(event.clone());
        }
    }

    fn presence_changed(&self, change: ChannelEvent) {
        self.send_all(change);
        self.send_all(ChannelEvent::PresenceSync(self.snapshot()));
    }
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Topic>,
    next_id: u64,
    offline: bool,
}

/// Shared in-process hub. Clones share the same topics.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// While offline, every send fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Number of subscribers currently on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.members.len())
            .unwrap_or(0)
    }

    fn leave(&self, topic: &str, member_id: u64) {
        let mut state = self.lock();
        let Some(t) = state.topics.get_mut(topic) else {
            return;
        };
        let Some(member) = t.members.remove(&member_id) else {
            return;
        };
        if let Some(presence) = member.presence {
            t.presence_changed(ChannelEvent::PresenceLeave {
                key: member.key,
                states: vec![presence],
            });
        }
        if t.members.is_empty() {
            state.topics.remove(topic);
        }
        debug!("Member {} left {}", member_id, topic);
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            let t = state.topics.entry(topic.to_string()).or_default();
            t.members.insert(
                id,
                Member {
                    key: presence_key.to_string(),
                    tx: tx.clone(),
                    presence: None,
                },
            );
            // late joiners learn the current presence right away
            let _ = tx.send(ChannelEvent::PresenceSync(t.snapshot()));
            id
        };

        debug!("Member {} joined {}", member_id, topic);
        Ok(Subscription {
            channel: Arc::new(LocalChannel {
                hub: self.clone(),
                topic: topic.to_string(),
                member_id,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

pub struct LocalChannel {
    hub: LocalHub,
    topic: String,
    member_id: u64,
    closed: AtomicBool,
}

impl LocalChannel {
    fn with_topic<T>(&self, f: impl FnOnce(&mut Topic, u64) -> T) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let mut state = self.hub.lock();
        if state.offline {
            return Err(SyncError::Transport("hub offline".to_string()));
        }
        let topic = state.topics.get_mut(&self.topic).ok_or(SyncError::Closed)?;
        if !topic.members.contains_key(&self.member_id) {
            return Err(SyncError::Closed);
        }
        Ok(f(topic, self.member_id))
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.with_topic(|topic, me| {
            for (id, member) in &topic.members {
                if *id != me {
                    let _ = member.tx.send(ChannelEvent::Broadcast {
                        event: event.to_string(),
                        payload: payload.clone(),
                    });
                }
            }
        })
    }

    async fn track(&self, state: PresenceState) -> Result<()> {
        self.with_topic(|topic, me| {
            let Some(member) = topic.members.get_mut(&me) else {
                return;
            };
            member.presence = Some(state.clone());
            let key = member.key.clone();
            topic.presence_changed(ChannelEvent::PresenceJoin {
                key,
                states: vec![state],
            });
        })
    }

    async fn untrack(&self) -> Result<()> {
        self.with_topic(|topic, me| {
            let Some(member) = topic.members.get_mut(&me) else {
                return;
            };
            if let Some(previous) = member.presence.take() {
                let key = member.key.clone();
                topic.presence_changed(ChannelEvent::PresenceLeave {
                    key,
                    states: vec![previous],
                });
            }
        })
    }

    async fn presence_state(&self) -> PresenceSnapshot {
        self.hub
            .lock()
            .topics
            .get(&self.topic)
            .map(Topic::snapshot)
            .unwrap_or_default()
    }

    async fn unsubscribe(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(&self.topic, self.member_id);
        }
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(&self.topic, self.member_id);
        }
    }
}
