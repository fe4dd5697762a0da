//! Nostr relay transport
//!
//! Channels map to ephemeral events (kind 25000) tagged with
//! `{app_id}-{topic}`. Relays do not store these, so presence is kept alive
//! by heartbeats: a tracked blob is re-announced every heartbeat interval and
//! dropped by peers once it goes quiet for longer than the disconnect
//! threshold. An explicit untrack removes it at once.

use crate::context::IdentityProvider;
use crate::error::{Result, SyncError};
use crate::transport::{Channel, ChannelEvent, PresenceSnapshot, Subscription, Transport};
use crate::types::*;
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Nostr client for channel traffic
pub struct NostrClient {
    client: Client,
    relays: Vec<String>,
    connected: Arc<RwLock<bool>>,
    public_key: String,
    app_id: String,
    heartbeat_interval: Duration,
    disconnect_threshold: Duration,
    profile: UserMetadata,
}

impl NostrClient {
    /// Create a new NostrClient with generated keys
    pub fn new(config: &SyncConfig) -> Self {
        Self::from_keys(Keys::generate(), config)
    }

    /// Create a new NostrClient with provided secret key
    pub fn with_secret_key(secret_key: &str, config: &SyncConfig) -> Result<Self> {
        let keys = Keys::parse(secret_key).map_err(|e| SyncError::Nostr(e.to_string()))?;
        Ok(Self::from_keys(keys, config))
    }

    fn from_keys(keys: Keys, config: &SyncConfig) -> Self {
        let public_key = keys.public_key().to_hex();
        Self {
            client: Client::new(keys),
            relays: config.relays.clone(),
            connected: Arc::new(RwLock::new(false)),
            public_key,
            app_id: config.app_id.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            disconnect_threshold: Duration::from_millis(config.disconnect_threshold_ms),
            profile: UserMetadata::default(),
        }
    }

    /// Display metadata reported as this client's identity
    pub fn with_profile(mut self, profile: UserMetadata) -> Self {
        self.profile = profile;
        self
    }

    /// Get the public key
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Connect to relays
    pub async fn connect(&self) -> Result<()> {
        for relay in &self.relays {
            if let Err(e) = self.client.add_relay(relay).await {
                warn!("Failed to add relay {}: {}", relay, e);
            }
        }

        self.client.connect().await;
        *self.connected.write().await = true;
        debug!("Connected to relays");
        Ok(())
    }

    /// Disconnect from relays
    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.client.disconnect().await;
        *self.connected.write().await = false;
        debug!("Disconnected from relays");
        Ok(())
    }

    /// Get relay connection status
    pub async fn relay_status(&self) -> Vec<(String, bool)> {
        let mut status = Vec::new();
        for relay in self.client.relays().await.values() {
            status.push((relay.url().to_string(), relay.is_connected()));
        }
        status
    }
}

/// Publish an ephemeral event (kind 25000)
async fn publish_ephemeral(client: &Client, tag: &str, content: &EventContent) -> Result<EventId> {
    let builder = EventBuilder::new(
        Kind::Custom(kinds::EPHEMERAL),
        serde_json::to_string(content)?,
    )
    .tags(vec![Tag::identifier(tag)]);

    let output = client
        .send_event_builder(builder)
        .await
        .map_err(|e| SyncError::Nostr(e.to_string()))?;

    Ok(*output.id())
}

impl IdentityProvider for NostrClient {
    fn current_user(&self) -> Option<User> {
        Some(User {
            id: self.public_key.clone(),
            metadata: self.profile.clone(),
        })
    }
}

#[async_trait]
impl Transport for NostrClient {
    async fn subscribe(&self, topic: &str, presence_key: &str) -> Result<Subscription> {
        if !self.is_connected().await {
            self.connect().await?;
        }

        let tag = create_topic_tag(&self.app_id, topic);
        let filter = Filter::new()
            .kind(Kind::Custom(kinds::EPHEMERAL))
            .identifier(&tag);

        let output = self
            .client
            .subscribe(vec![filter], None)
            .await
            .map_err(|e| SyncError::Nostr(e.to_string()))?;
        let sub_id = output.id().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let presence = PresenceTable::new(presence_key);
        let _ = tx.send(ChannelEvent::PresenceSync(presence.snapshot().await));

        let listener = spawn_listener(
            self.client.clone(),
            sub_id.clone(),
            self.public_key.clone(),
            presence.clone(),
            tx.clone(),
        );
        let heartbeat = spawn_heartbeat(
            self.client.clone(),
            tag.clone(),
            presence.clone(),
            tx.clone(),
            self.heartbeat_interval,
            self.disconnect_threshold,
        );

        debug!("Subscribed to channel: {}", tag);
        Ok(Subscription {
            channel: Arc::new(NostrChannel {
                client: self.client.clone(),
                topic: topic.to_string(),
                tag,
                sub_id,
                presence,
                tx,
                tasks: vec![listener, heartbeat],
            }),
            events: rx,
        })
    }
}

// =========================================================================
// Presence bookkeeping
// =========================================================================

struct RemotePresence {
    key: String,
    state: PresenceState,
    last_seen: u64,
}

/// Own tracked blob plus the blobs announced by peers, keyed by session
#[derive(Clone)]
struct PresenceTable {
    key: String,
    session: String,
    own: Arc<RwLock<Option<PresenceState>>>,
    peers: Arc<RwLock<HashMap<String, RemotePresence>>>,
}

impl PresenceTable {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            session: generate_session_id(),
            own: Arc::new(RwLock::new(None)),
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        if let Some(state) = self.own.read().await.clone() {
            snapshot.insert(self.key.clone(), state);
        }
        let peers = self.peers.read().await;
        let mut sessions: Vec<_> = peers.keys().collect();
        sessions.sort();
        for session in sessions {
            let peer = &peers[session];
            snapshot.insert(peer.key.clone(), peer.state.clone());
        }
        snapshot
    }

    fn track_content(&self, state: PresenceState) -> EventContent {
        EventContent::Track(TrackEventContent {
            key: self.key.clone(),
            session: self.session.clone(),
            state,
        })
    }

    fn untrack_content(&self) -> EventContent {
        EventContent::Untrack(UntrackEventContent {
            key: self.key.clone(),
            session: self.session.clone(),
        })
    }
}

async fn emit_presence(
    presence: &PresenceTable,
    tx: &mpsc::UnboundedSender<ChannelEvent>,
    change: ChannelEvent,
) {
    let _ = tx.send(change);
    let _ = tx.send(ChannelEvent::PresenceSync(presence.snapshot().await));
}

fn spawn_listener(
    client: Client,
    sub_id: SubscriptionId,
    my_pubkey: String,
    presence: PresenceTable,
    tx: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = client.notifications();
        loop {
            let notification = match notifications.recv().await {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Relay notifications lagged, {} skipped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let RelayPoolNotification::Event {
                subscription_id,
                event,
                ..
            } = notification
            else {
                continue;
            };

            // Skip other subscriptions and own events
            if subscription_id != sub_id || event.pubkey.to_hex() == my_pubkey {
                continue;
            }

            let content = match serde_json::from_str::<EventContent>(&event.content) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Ignoring unreadable channel event: {}", e);
                    continue;
                }
            };

            match content {
                EventContent::Broadcast(b) => {
                    let _ = tx.send(ChannelEvent::Broadcast {
                        event: b.event,
                        payload: b.payload,
                    });
                }

                EventContent::Track(t) => {
                    let is_new = presence
                        .peers
                        .write()
                        .await
                        .insert(
                            t.session.clone(),
                            RemotePresence {
                                key: t.key.clone(),
                                state: t.state.clone(),
                                last_seen: now_ms(),
                            },
                        )
                        .map_or(true, |previous| previous.state != t.state);

                    if is_new {
                        let change = ChannelEvent::PresenceJoin {
                            key: t.key,
                            states: vec![t.state],
                        };
                        emit_presence(&presence, &tx, change).await;
                    }
                }

                EventContent::Untrack(u) => {
                    let removed = presence.peers.write().await.remove(&u.session);
                    if let Some(previous) = removed {
                        let change = ChannelEvent::PresenceLeave {
                            key: previous.key,
                            states: vec![previous.state],
                        };
                        emit_presence(&presence, &tx, change).await;
                    }
                }
            }
        }
    })
}

fn spawn_heartbeat(
    client: Client,
    tag: String,
    presence: PresenceTable,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    period: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;

            let own = presence.own.read().await.clone();
            if let Some(state) = own {
                let content = presence.track_content(state);
                if let Err(e) = publish_ephemeral(&client, &tag, &content).await {
                    warn!("Failed to send presence heartbeat: {}", e);
                }
            }

            // Drop peers that went quiet without retracting
            let now = now_ms();
            let stale: Vec<RemotePresence> = {
                let mut peers = presence.peers.write().await;
                let expired: Vec<String> = peers
                    .iter()
                    .filter(|(_, p)| now.saturating_sub(p.last_seen) > threshold.as_millis() as u64)
                    .map(|(session, _)| session.clone())
                    .collect();
                expired
                    .into_iter()
                    .filter_map(|session| peers.remove(&session))
                    .collect()
            };

            for peer in stale {
                let change = ChannelEvent::PresenceLeave {
                    key: peer.key,
                    states: vec![peer.state],
                };
                emit_presence(&presence, &tx, change).await;
            }
        }
    })
}

// =========================================================================
// Channel
// =========================================================================

pub struct NostrChannel {
    client: Client,
    topic: String,
    tag: String,
    sub_id: SubscriptionId,
    presence: PresenceTable,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Channel for NostrChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        let content = EventContent::Broadcast(BroadcastEventContent {
            event: event.to_string(),
            payload,
        });
        publish_ephemeral(&self.client, &self.tag, &content).await?;
        Ok(())
    }

    async fn track(&self, state: PresenceState) -> Result<()> {
        *self.presence.own.write().await = Some(state.clone());
        let change = ChannelEvent::PresenceJoin {
            key: self.presence.key.clone(),
            states: vec![state.clone()],
        };
        emit_presence(&self.presence, &self.tx, change).await;

        publish_ephemeral(&self.client, &self.tag, &self.presence.track_content(state)).await?;
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        let Some(previous) = self.presence.own.write().await.take() else {
            return Ok(());
        };
        let change = ChannelEvent::PresenceLeave {
            key: self.presence.key.clone(),
            states: vec![previous],
        };
        emit_presence(&self.presence, &self.tx, change).await;

        publish_ephemeral(&self.client, &self.tag, &self.presence.untrack_content()).await?;
        Ok(())
    }

    async fn presence_state(&self) -> PresenceSnapshot {
        self.presence.snapshot().await
    }

    async fn unsubscribe(&self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        self.client.unsubscribe(self.sub_id.clone()).await;
        debug!("Unsubscribed from channel: {}", self.tag);
        Ok(())
    }
}

impl Drop for NostrChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
