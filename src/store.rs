//! Durable store contract
//!
//! Three tables back the game: `games`, the `game_players` roster, and the
//! `moves` log used by the append-log strategy. Every mutation is published
//! as a [`Change`] that subscribers receive through a filtered [`ChangeFeed`].

use crate::error::Result;
use crate::moves::{LoggedMove, Move};
use crate::types::{Game, GameStatus, NewGame, RosterEntry};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Games,
    Players,
    Moves,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Game(Game),
    Player(RosterEntry),
    Move(LoggedMove),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Game(_) => Table::Games,
            Row::Player(_) => Table::Players,
            Row::Move(_) => Table::Moves,
        }
    }

    /// Column value rendered as text, for equality filters.
    pub fn field(&self, column: &str) -> Option<String> {
        match (self, column) {
            (Row::Game(g), "id") => Some(g.id.clone()),
            (Row::Game(g), "host_user_id") => Some(g.host_user_id.clone()),
            (Row::Game(g), "status") => Some(g.status.as_str().to_string()),
            (Row::Player(p), "game_id") => Some(p.game_id.clone()),
            (Row::Player(p), "user_id") => Some(p.user_id.clone()),
            (Row::Move(m), "game_id") => Some(m.game_id.clone()),
            (Row::Move(m), "author") => Some(m.mv.author.clone()),
            _ => None,
        }
    }
}

/// One row-level mutation. `old` is set for updates and deletes, `new` for
/// inserts and updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl Change {
    pub fn insert(row: Row) -> Self {
        Self {
            table: row.table(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: Row, new: Row) -> Self {
        Self {
            table: new.table(),
            kind: ChangeKind::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            table: old.table(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }
}

/// Table, optional event type, and optional `column = value` predicate.
///
/// An update matches when either its old or its new row satisfies the
/// predicate, so subscribers also see rows leaving the filtered set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: Table,
    pub kind: Option<ChangeKind>,
    pub eq: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            kind: None,
            eq: None,
        }
    }

    pub fn event(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.eq = Some((column.into(), value.into()));
        self
    }

    pub fn matches(&self, change: &Change) -> bool {
        if change.table != self.table {
            return false;
        }
        if let Some(kind) = self.kind {
            if change.kind != kind {
                return false;
            }
        }
        let Some((column, value)) = &self.eq else {
            return true;
        };
        [&change.new, &change.old]
            .into_iter()
            .flatten()
            .any(|row| row.field(column).as_deref() == Some(value.as_str()))
    }
}

/// One delivery from a [`ChangeFeed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Change(Change),
    /// The subscriber fell behind and `n` changes were dropped. Anything
    /// built from earlier changes must be reloaded from the store.
    Lagged(u64),
}

impl FeedItem {
    pub fn into_change(self) -> Option<Change> {
        match self {
            FeedItem::Change(change) => Some(change),
            FeedItem::Lagged(_) => None,
        }
    }
}

/// Filtered subscription to store changes. Dropping it cancels delivery.
pub struct ChangeFeed {
    rx: broadcast::Receiver<Change>,
    filter: ChangeFilter,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<Change>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Next matching change or lag marker, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => {
                    return Some(FeedItem::Change(change));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Change feed lagged, {} changes skipped", n);
                    return Some(FeedItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Result of removing a roster entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// Whether an entry was deleted
    pub removed: bool,
    /// Entries left for the game afterwards
    pub remaining: usize,
    /// Whether the game row was deleted because no entries remained
    pub game_deleted: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_game(&self, game: NewGame) -> Result<Game>;

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>>;

    /// Games in `status`, most recently updated first.
    async fn list_games(&self, status: GameStatus) -> Result<Vec<Game>>;

    /// Overwrite the stored grid text. Applies only while the game still
    /// accepts grid writes; returns whether a row was updated.
    async fn save_puzzle(&self, game_id: &str, puzzle: &str) -> Result<bool>;

    /// Compare-and-set status change. Returns whether the stored status was
    /// `from` and is now `to`.
    async fn transition(&self, game_id: &str, from: GameStatus, to: GameStatus) -> Result<bool>;

    async fn delete_game(&self, game_id: &str) -> Result<bool>;

    /// Insert a roster entry. `(game_id, user_id)` is unique; returns `None`
    /// when the entry already exists.
    async fn insert_player(&self, game_id: &str, user_id: &str) -> Result<Option<RosterEntry>>;

    async fn list_players(&self, game_id: &str) -> Result<Vec<RosterEntry>>;

    async fn count_players(&self, game_id: &str) -> Result<usize>;

    /// Delete a roster entry and, in the same atomic step, the game row if
    /// that left the roster empty.
    async fn remove_player(&self, game_id: &str, user_id: &str) -> Result<Removal>;

    /// Append a move to the game's log and return it with its sequence number.
    async fn append_move(&self, game_id: &str, mv: Move) -> Result<LoggedMove>;

    /// The game's full log in sequence order.
    async fn list_moves(&self, game_id: &str) -> Result<Vec<LoggedMove>>;

    fn watch(&self, filter: ChangeFilter) -> ChangeFeed;
}
