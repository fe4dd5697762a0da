//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use sudoku_sync::memory::MemoryStore;
use sudoku_sync::moves::{LoggedMove, Move};
use sudoku_sync::store::{ChangeFeed, ChangeFilter, Removal};
use sudoku_sync::{
    Game, GameStatus, LocalHub, NewGame, RosterEntry, StaticIdentity, Store, SyncConfig,
    SyncContext, SyncError, User,
};

pub const PUZZLE: &str =
    "53--7----6--195----98----6-8---6---34--8-3--17---2---6-6----28----419--5----8--79";
pub const SOLUTION: &str =
    "534678912672195348198342567859761423426853791713924856961537284287419635345286179";

/// SOLUTION with only (0, 2) left open.
pub fn almost_solved() -> String {
    let mut text = SOLUTION.to_string();
    text.replace_range(2..3, "-");
    text
}

/// Poll `$cond` until it holds, failing after two seconds.
macro_rules! eventually {
    ($cond:expr) => {
        tokio::time::timeout(tokio::time::Duration::from_secs(2), async {
            loop {
                if $cond {
                    break;
                }
                tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

pub fn config() -> SyncConfig {
    SyncConfig::new("sudoku-test")
        .snapshot_debounce_ms(50)
        .cursor_interval_ms(20)
}

pub fn context(store: Arc<dyn Store>, hub: &LocalHub, user: &str, config: SyncConfig) -> SyncContext {
    SyncContext::new(
        store,
        Arc::new(hub.clone()),
        Arc::new(StaticIdentity::new(User::new(user, user))),
        config,
    )
}

/// Store whose move log reads and status transitions can be made to fail
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: Arc<AtomicBool>,
    fail_transitions: Arc<AtomicBool>,
    transition_attempts: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail transitions and reset the attempt count.
    pub fn set_fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
        self.transition_attempts.store(0, Ordering::SeqCst);
    }

    pub fn transition_attempts(&self) -> usize {
        self.transition_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_game(&self, game: NewGame) -> sudoku_sync::Result<Game> {
        self.inner.insert_game(game).await
    }

    async fn get_game(&self, game_id: &str) -> sudoku_sync::Result<Option<Game>> {
        self.inner.get_game(game_id).await
    }

    async fn list_games(&self, status: GameStatus) -> sudoku_sync::Result<Vec<Game>> {
        self.inner.list_games(status).await
    }

    async fn save_puzzle(&self, game_id: &str, puzzle: &str) -> sudoku_sync::Result<bool> {
        self.inner.save_puzzle(game_id, puzzle).await
    }

    async fn transition(
        &self,
        game_id: &str,
        from: GameStatus,
        to: GameStatus,
    ) -> sudoku_sync::Result<bool> {
        self.transition_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(SyncError::Store("status update unavailable".to_string()));
        }
        self.inner.transition(game_id, from, to).await
    }

    async fn delete_game(&self, game_id: &str) -> sudoku_sync::Result<bool> {
        self.inner.delete_game(game_id).await
    }

    async fn insert_player(
        &self,
        game_id: &str,
        user_id: &str,
    ) -> sudoku_sync::Result<Option<RosterEntry>> {
        self.inner.insert_player(game_id, user_id).await
    }

    async fn list_players(&self, game_id: &str) -> sudoku_sync::Result<Vec<RosterEntry>> {
        self.inner.list_players(game_id).await
    }

    async fn count_players(&self, game_id: &str) -> sudoku_sync::Result<usize> {
        self.inner.count_players(game_id).await
    }

    async fn remove_player(&self, game_id: &str, user_id: &str) -> sudoku_sync::Result<Removal> {
        self.inner.remove_player(game_id, user_id).await
    }

    async fn append_move(&self, game_id: &str, mv: Move) -> sudoku_sync::Result<LoggedMove> {
        self.inner.append_move(game_id, mv).await
    }

    async fn list_moves(&self, game_id: &str) -> sudoku_sync::Result<Vec<LoggedMove>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Store("move log unavailable".to_string()));
        }
        self.inner.list_moves(game_id).await
    }

    fn watch(&self, filter: ChangeFilter) -> ChangeFeed {
        self.inner.watch(filter)
    }
}
