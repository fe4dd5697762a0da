//! Live cursors
//!
//! Pointer positions travel as `mousemove` broadcasts on the game's cursor
//! channel. Receivers keep the latest position per user and drop users that
//! disappear from the channel's presence. Outgoing positions are throttled by
//! sample-and-hold: at most one send per interval, and the last position
//! sampled inside an interval is sent when it closes.

use crate::context::SyncContext;
use crate::error::Result;
use crate::transport::{release, Channel, ChannelEvent, PresenceSnapshot};
use crate::types::{cursor_channel, random_color, PresenceState, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Broadcast event name carrying a pointer position
pub const CURSOR_EVENT: &str = "mousemove";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUser {
    pub id: String,
    pub username: String,
}

/// Wire shape of one cursor broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub position: Position,
    pub user: CursorUser,
    pub color: String,
}

/// Latest known cursor of one remote user
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub position: Position,
}

/// `{id, display_name}` of a user currently on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentUser {
    pub id: String,
    pub display_name: String,
}

/// One entry per presence key.
pub fn present_users(snapshot: &PresenceSnapshot) -> Vec<PresentUser> {
    snapshot
        .members()
        .into_iter()
        .map(|state| PresentUser {
            id: state.user_id,
            display_name: state.display_name,
        })
        .collect()
}

/// Remote cursors keyed by user id
#[derive(Debug, Clone, Default)]
pub struct CursorBoard {
    own_id: String,
    cursors: HashMap<String, RemoteCursor>,
}

impl CursorBoard {
    pub fn new(own_id: impl Into<String>) -> Self {
        Self {
            own_id: own_id.into(),
            cursors: HashMap::new(),
        }
    }

    /// Record a broadcast position. Our own cursor is never stored.
    pub fn apply(&mut self, payload: CursorPayload) -> bool {
        if payload.user.id == self.own_id {
            return false;
        }
        self.cursors.insert(
            payload.user.id.clone(),
            RemoteCursor {
                user_id: payload.user.id,
                display_name: payload.user.username,
                color: payload.color,
                position: payload.position,
            },
        );
        true
    }

    /// Drop cursors of users no longer present. Returns how many went.
    pub fn prune(&mut self, snapshot: &PresenceSnapshot) -> usize {
        let before = self.cursors.len();
        self.cursors.retain(|id, _| snapshot.contains(id));
        before - self.cursors.len()
    }

    pub fn get(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    /// All cursors, ordered by user id.
    pub fn cursors(&self) -> Vec<RemoteCursor> {
        let mut cursors: Vec<_> = self.cursors.values().cloned().collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Sample-and-hold rate limiter for outgoing positions
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    held: Option<Position>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            held: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    /// Offer a new position. Returns it if it may go out now; otherwise it is
    /// held, replacing any earlier held position.
    pub fn sample(&mut self, position: Position, now: Instant) -> Option<Position> {
        if self.is_due(now) {
            self.last_sent = Some(now);
            self.held = None;
            Some(position)
        } else {
            self.held = Some(position);
            None
        }
    }

    /// Release the held position once its interval has closed.
    pub fn take_due(&mut self, now: Instant) -> Option<Position> {
        if self.held.is_none() || !self.is_due(now) {
            return None;
        }
        self.last_sent = Some(now);
        self.held.take()
    }

    pub fn held(&self) -> Option<Position> {
        self.held
    }
}

/// Cursor channel driver for one game view
pub struct CursorOverlay {
    channel: Arc<dyn Channel>,
    me: CursorUser,
    color: String,
    board: Arc<RwLock<CursorBoard>>,
    present: Arc<RwLock<Vec<PresentUser>>>,
    throttle: Arc<Mutex<CursorThrottle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CursorOverlay {
    pub async fn open(ctx: &SyncContext, game_id: &str) -> Result<Self> {
        let user = ctx.current_user()?;
        let color = user.metadata.color.clone().unwrap_or_else(random_color);
        let me = CursorUser {
            id: user.id.clone(),
            username: user.display_name().to_string(),
        };

        let sub = ctx
            .transport()
            .subscribe(&cursor_channel(game_id), &user.id)
            .await?;
        let channel = sub.channel;
        let mut events = sub.events;

        let board = Arc::new(RwLock::new(CursorBoard::new(user.id.clone())));
        let present = Arc::new(RwLock::new(Vec::new()));
        let throttle = Arc::new(Mutex::new(CursorThrottle::new(Duration::from_millis(
            ctx.config().cursor_interval_ms,
        ))));

        let receiver = {
            let channel = channel.clone();
            let board = board.clone();
            let present = present.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let snapshot = match event {
                        ChannelEvent::Broadcast { event, payload } if event == CURSOR_EVENT => {
                            match serde_json::from_value::<CursorPayload>(payload) {
                                Ok(cursor) => {
                                    board.write().await.apply(cursor);
                                }
                                Err(e) => debug!("Ignoring malformed cursor: {}", e),
                            }
                            continue;
                        }
                        ChannelEvent::Broadcast { .. } => continue,
                        ChannelEvent::PresenceSync(snapshot) => snapshot,
                        ChannelEvent::PresenceJoin { .. } | ChannelEvent::PresenceLeave { .. } => {
                            channel.presence_state().await
                        }
                    };

                    let pruned = board.write().await.prune(&snapshot);
                    if pruned > 0 {
                        debug!("Pruned {} stale cursors", pruned);
                    }
                    *present.write().await = present_users(&snapshot);
                }
            })
        };

        let flusher = {
            let channel = channel.clone();
            let throttle = throttle.clone();
            let me = me.clone();
            let color = color.clone();
            let period = Duration::from_millis(ctx.config().cursor_interval_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let due = throttle.lock().await.take_due(Instant::now());
                    if let Some(position) = due {
                        if let Err(e) = send_position(channel.as_ref(), &me, &color, position).await {
                            warn!("Failed to send held cursor: {}", e);
                        }
                    }
                }
            })
        };

        channel
            .track(PresenceState {
                user_id: user.id.clone(),
                display_name: me.username.clone(),
                ready: false,
            })
            .await?;

        Ok(Self {
            channel,
            me,
            color,
            board,
            present,
            throttle,
            tasks: vec![receiver, flusher],
        })
    }

    pub fn user(&self) -> User {
        User::new(self.me.id.clone(), self.me.username.clone()).with_color(self.color.clone())
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    /// Report a local pointer move. Sends at most once per interval.
    pub async fn move_pointer(&self, x: f64, y: f64) -> Result<()> {
        let due = self
            .throttle
            .lock()
            .await
            .sample(Position { x, y }, Instant::now());
        match due {
            Some(position) => send_position(self.channel.as_ref(), &self.me, &self.color, position).await,
            None => Ok(()),
        }
    }

    pub async fn cursors(&self) -> Vec<RemoteCursor> {
        self.board.read().await.cursors()
    }

    pub async fn present_users(&self) -> Vec<PresentUser> {
        self.present.read().await.clone()
    }

    /// Retract presence and leave the channel.
    pub async fn close(&self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        release(self.channel.as_ref()).await
    }
}

impl Drop for CursorOverlay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn send_position(channel: &dyn Channel, me: &CursorUser, color: &str, position: Position) -> Result<()> {
    let payload = serde_json::to_value(CursorPayload {
        position,
        user: me.clone(),
        color: color.to_string(),
    })?;
    channel.broadcast(CURSOR_EVENT, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(user: &str, x: f64) -> CursorPayload {
        CursorPayload {
            position: Position { x, y: 0.0 },
            user: CursorUser {
                id: user.to_string(),
                username: user.to_string(),
            },
            color: "hsl(10, 100%, 70%)".to_string(),
        }
    }

    fn presence(users: &[&str]) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        for user in users {
            snapshot.insert(
                *user,
                PresenceState {
                    user_id: user.to_string(),
                    display_name: user.to_string(),
                    ready: false,
                },
            );
        }
        snapshot
    }

    #[test]
    fn latest_position_wins() {
        let mut board = CursorBoard::new("me");
        board.apply(payload("bob", 1.0));
        board.apply(payload("bob", 2.0));
        assert_eq!(board.len(), 1);
        assert_eq!(board.get("bob").unwrap().position.x, 2.0);
        assert!(!board.apply(payload("me", 3.0)));
    }

    #[test]
    fn prune_drops_absent_users() {
        let mut board = CursorBoard::new("me");
        board.apply(payload("bob", 1.0));
        board.apply(payload("carol", 1.0));
        assert_eq!(board.prune(&presence(&["me", "bob"])), 1);
        assert!(board.get("carol").is_none());
    }

    #[test]
    fn wire_shape() {
        let value = serde_json::to_value(payload("bob", 4.0)).unwrap();
        assert_eq!(value["position"]["x"], 4.0);
        assert_eq!(value["user"]["username"], "bob");
        assert!(value["color"].as_str().unwrap().starts_with("hsl("));
    }

    #[test]
    fn throttle_holds_last_sample() {
        let start = Instant::now();
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let at = |ms| start + Duration::from_millis(ms);

        assert!(throttle.sample(Position { x: 1.0, y: 0.0 }, at(0)).is_some());
        assert!(throttle.sample(Position { x: 2.0, y: 0.0 }, at(10)).is_none());
        assert!(throttle.sample(Position { x: 3.0, y: 0.0 }, at(20)).is_none());
        assert!(throttle.take_due(at(30)).is_none());

        let held = throttle.take_due(at(50)).unwrap();
        assert_eq!(held.x, 3.0);
        assert!(throttle.held().is_none());
        assert!(throttle.take_due(at(200)).is_none());
    }

    #[test]
    fn present_users_one_per_key() {
        let users = present_users(&presence(&["alice", "bob"]));
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "alice");
    }
}
