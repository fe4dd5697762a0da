//! Type definitions for sudoku-sync

use serde::{Deserialize, Serialize};

/// Nostr event kinds used by the relay transport
pub mod kinds {
    /// Ephemeral event for channel traffic (not stored by relays)
    pub const EPHEMERAL: u16 = 25000;
}

/// Game status. Transitions only move forward: lobby, active, finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    #[default]
    Lobby,
    #[serde(alias = "in_progress")]
    Active,
    Finished,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Lobby => "lobby",
            GameStatus::Active => "active",
            GameStatus::Finished => "finished",
        }
    }

    /// Whether the stored puzzle text may still be rewritten by the host.
    pub fn accepts_grid_writes(&self) -> bool {
        matches!(self, GameStatus::Lobby | GameStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// How cell edits reach the other clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStrategy {
    /// Ephemeral broadcast of each edit; the host persists debounced grid snapshots
    #[default]
    Snapshot,
    /// Every edit is appended to a durable move log and replayed on join
    AppendLog,
}

/// Synchronization configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Namespace for channel names on shared relays (e.g., "sudoku")
    pub app_id: String,
    /// Nostr relay URLs
    pub relays: Vec<String>,
    /// Replication strategy (default: Snapshot)
    pub strategy: ReplicationStrategy,
    /// Quiet period before the host persists a grid snapshot, in ms (default: 400)
    pub snapshot_debounce_ms: u64,
    /// Players needed before the lobby may auto-start (default: 2)
    pub required_players: usize,
    /// Minimum interval between cursor broadcasts in ms (default: 50)
    pub cursor_interval_ms: u64,
    /// Presence heartbeat interval in ms (default: 3000)
    pub heartbeat_interval_ms: u64,
    /// Presence records older than this are dropped, in ms (default: 10000)
    pub disconnect_threshold_ms: u64,
    /// Status the open-games directory is filtered on (default: Active)
    pub directory_status: GameStatus,
    /// Capacity of session event channels (default: 100)
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_id: "sudoku".to_string(),
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            strategy: ReplicationStrategy::Snapshot,
            snapshot_debounce_ms: 400,
            required_players: 2,
            cursor_interval_ms: 50,
            heartbeat_interval_ms: 3000,
            disconnect_threshold_ms: 10000,
            directory_status: GameStatus::Active,
            event_capacity: 100,
        }
    }
}

impl SyncConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn strategy(mut self, strategy: ReplicationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn snapshot_debounce_ms(mut self, ms: u64) -> Self {
        self.snapshot_debounce_ms = ms;
        self
    }

    pub fn required_players(mut self, n: usize) -> Self {
        self.required_players = n;
        self
    }

    pub fn cursor_interval_ms(mut self, ms: u64) -> Self {
        self.cursor_interval_ms = ms;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn disconnect_threshold_ms(mut self, ms: u64) -> Self {
        self.disconnect_threshold_ms = ms;
        self
    }

    pub fn directory_status(mut self, status: GameStatus) -> Self {
        self.directory_status = status;
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n.max(1);
        self
    }
}

/// Persisted game row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub host_user_id: String,
    pub status: GameStatus,
    pub difficulty: Difficulty,
    /// Puzzle text as hosted; decides which cells are fixed. Never rewritten.
    pub givens: String,
    /// Current grid text (81 chars). Rewritten by the host under the snapshot strategy.
    pub puzzle: String,
    pub solution: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

/// Values supplied when hosting a game; the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGame {
    pub host_user_id: String,
    pub difficulty: Difficulty,
    pub puzzle: String,
    pub solution: String,
}

/// One player's membership in a game
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub game_id: String,
    pub user_id: String,
    pub joined_at: u64,
}

/// Display metadata attached to a signed-in user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub metadata: UserMetadata,
}

impl User {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: UserMetadata {
                display_name: display_name.into(),
                color: None,
            },
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.metadata.color = Some(color.into());
        self
    }

    /// Display name, falling back to "Anonymous" when empty.
    pub fn display_name(&self) -> &str {
        if self.metadata.display_name.is_empty() {
            "Anonymous"
        } else {
            &self.metadata.display_name
        }
    }
}

/// Presence blob one subscriber tracks on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub ready: bool,
}

/// Channel carrying cell-update broadcasts for one game
pub fn grid_channel(game_id: &str) -> String {
    format!("sudoku::{game_id}")
}

/// Channel carrying lobby presence (readiness) for one game
pub fn lobby_channel(game_id: &str) -> String {
    format!("lobby:{game_id}")
}

/// Channel carrying cursor broadcasts and presence for one game
pub fn cursor_channel(game_id: &str) -> String {
    format!("presence-room-{game_id}")
}

/// Relay tag scoping a channel to this application
pub fn create_topic_tag(app_id: &str, topic: &str) -> String {
    format!("{app_id}-{topic}")
}

/// Generate a unique game ID (8 chars)
pub fn generate_game_id() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Generate a session-unique presence id
pub fn generate_session_id() -> String {
    use rand::Rng;
    format!("{:016x}", rand::thread_rng().r#gen::<u64>())
}

/// Random vivid cursor color as a CSS `hsl()` string
pub fn random_color() -> String {
    use rand::Rng;
    format!("hsl({}, 100%, 70%)", rand::thread_rng().gen_range(0..360))
}

/// Current time in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// Event content carried by relay transport events

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventContent {
    Broadcast(BroadcastEventContent),
    Track(TrackEventContent),
    Untrack(UntrackEventContent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEventContent {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEventContent {
    pub key: String,
    pub session: String,
    pub state: PresenceState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UntrackEventContent {
    pub key: String,
    pub session: String,
}
