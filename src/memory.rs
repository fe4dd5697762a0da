//! In-process store
//!
//! Keeps all three tables behind one lock so every operation, including the
//! roster removal with its empty-game cleanup, is atomic. Changes fan out on a
//! tokio broadcast channel.

use crate::error::{Result, SyncError};
use crate::moves::{LoggedMove, Move};
use crate::store::{Change, ChangeFeed, ChangeFilter, Removal, Row, Store};
use crate::types::{generate_game_id, now_ms, Game, GameStatus, NewGame, RosterEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    games: HashMap<String, Game>,
    players: Vec<RosterEntry>,
    moves: Vec<LoggedMove>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(FEED_CAPACITY)
    }

    /// Store whose change feed buffers `capacity` changes per subscriber.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            changes,
        }
    }

    fn publish(&self, change: Change) {
        // no subscribers is fine
        let _ = self.changes.send(change);
    }
}

fn remove_game(tables: &mut Tables, game_id: &str) -> Vec<Change> {
    let mut changes = Vec::new();
    let Some(game) = tables.games.remove(game_id) else {
        return changes;
    };

    let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.players)
        .into_iter()
        .partition(|p| p.game_id == game_id);
    tables.players = kept;
    tables.moves.retain(|m| m.game_id != game_id);

    changes.extend(gone.into_iter().map(|p| Change::delete(Row::Player(p))));
    changes.push(Change::delete(Row::Game(game)));
    changes
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_game(&self, new: NewGame) -> Result<Game> {
        let now = now_ms();
        let game = Game {
            id: generate_game_id(),
            host_user_id: new.host_user_id,
            status: GameStatus::Lobby,
            difficulty: new.difficulty,
            givens: new.puzzle.clone(),
            puzzle: new.puzzle,
            solution: new.solution,
            created_at: now,
            updated_at: now,
            started_at: None,
        };

        self.tables
            .write()
            .await
            .games
            .insert(game.id.clone(), game.clone());
        self.publish(Change::insert(Row::Game(game.clone())));
        debug!("Inserted game {}", game.id);
        Ok(game)
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
        Ok(self.tables.read().await.games.get(game_id).cloned())
    }

    async fn list_games(&self, status: GameStatus) -> Result<Vec<Game>> {
        let tables = self.tables.read().await;
        let mut games: Vec<Game> = tables
            .games
            .values()
            .filter(|g| g.status == status)
            .cloned()
            .collect();
        games.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(games)
    }

    async fn save_puzzle(&self, game_id: &str, puzzle: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(game) = tables.games.get_mut(game_id) else {
            return Ok(false);
        };
        if !game.status.accepts_grid_writes() {
            return Ok(false);
        }

        let old = game.clone();
        game.puzzle = puzzle.to_string();
        game.updated_at = now_ms();
        let new = game.clone();
        drop(tables);

        self.publish(Change::update(Row::Game(old), Row::Game(new)));
        Ok(true)
    }

    async fn transition(&self, game_id: &str, from: GameStatus, to: GameStatus) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(game) = tables.games.get_mut(game_id) else {
            return Ok(false);
        };
        if game.status != from {
            return Ok(false);
        }

        let old = game.clone();
        let now = now_ms();
        game.status = to;
        game.updated_at = now;
        if to == GameStatus::Active {
            game.started_at = Some(now);
        }
        let new = game.clone();
        drop(tables);

        info!("Game {} moved from {} to {}", game_id, from.as_str(), to.as_str());
        self.publish(Change::update(Row::Game(old), Row::Game(new)));
        Ok(true)
    }

    async fn delete_game(&self, game_id: &str) -> Result<bool> {
        let changes = remove_game(&mut *self.tables.write().await, game_id);
        let deleted = !changes.is_empty();
        for change in changes {
            self.publish(change);
        }
        Ok(deleted)
    }

    async fn insert_player(&self, game_id: &str, user_id: &str) -> Result<Option<RosterEntry>> {
        let mut tables = self.tables.write().await;
        if !tables.games.contains_key(game_id) {
            return Err(SyncError::GameNotFound(game_id.to_string()));
        }
        if tables
            .players
            .iter()
            .any(|p| p.game_id == game_id && p.user_id == user_id)
        {
            return Ok(None);
        }

        let entry = RosterEntry {
            game_id: game_id.to_string(),
            user_id: user_id.to_string(),
            joined_at: now_ms(),
        };
        tables.players.push(entry.clone());
        drop(tables);

        self.publish(Change::insert(Row::Player(entry.clone())));
        Ok(Some(entry))
    }

    async fn list_players(&self, game_id: &str) -> Result<Vec<RosterEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .players
            .iter()
            .filter(|p| p.game_id == game_id)
            .cloned()
            .collect())
    }

    async fn count_players(&self, game_id: &str) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.players.iter().filter(|p| p.game_id == game_id).count())
    }

    async fn remove_player(&self, game_id: &str, user_id: &str) -> Result<Removal> {
        let mut tables = self.tables.write().await;
        let mut changes = Vec::new();

        let before = tables.players.len();
        let mut removed_rows = Vec::new();
        tables.players.retain(|p| {
            if p.game_id == game_id && p.user_id == user_id {
                removed_rows.push(p.clone());
                false
            } else {
                true
            }
        });
        let removed = tables.players.len() < before;
        changes.extend(removed_rows.into_iter().map(|p| Change::delete(Row::Player(p))));

        let remaining = tables.players.iter().filter(|p| p.game_id == game_id).count();
        let game_deleted = remaining == 0 && tables.games.contains_key(game_id);
        if game_deleted {
            changes.extend(remove_game(&mut tables, game_id));
        }
        drop(tables);

        for change in changes {
            self.publish(change);
        }
        Ok(Removal {
            removed,
            remaining,
            game_deleted,
        })
    }

    async fn append_move(&self, game_id: &str, mv: Move) -> Result<LoggedMove> {
        let mut tables = self.tables.write().await;
        if !tables.games.contains_key(game_id) {
            return Err(SyncError::GameNotFound(game_id.to_string()));
        }

        tables.next_seq += 1;
        let logged = LoggedMove {
            seq: tables.next_seq,
            game_id: game_id.to_string(),
            mv,
        };
        tables.moves.push(logged.clone());
        // published under the lock so the feed sees the log in seq order
        self.publish(Change::insert(Row::Move(logged.clone())));
        drop(tables);

        Ok(logged)
    }

    async fn list_moves(&self, game_id: &str) -> Result<Vec<LoggedMove>> {
        let tables = self.tables.read().await;
        Ok(tables
            .moves
            .iter()
            .filter(|m| m.game_id == game_id)
            .cloned()
            .collect())
    }

    fn watch(&self, filter: ChangeFilter) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe(), filter)
    }
}
