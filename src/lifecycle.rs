//! Roster and game lifecycle
//!
//! Games move `lobby -> active -> finished` and never back. Every status
//! change goes through the store's compare-and-set so racing clients cannot
//! clobber each other. The roster and open-games caches are reducers over
//! store changes; callers watch first and load second so nothing committed
//! in between is missed.

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::grid::Grid;
use crate::store::{
    Change, ChangeFeed, ChangeFilter, ChangeKind, FeedItem, Removal, Row, Store, Table,
};
use crate::types::{Difficulty, Game, GameStatus, NewGame, RosterEntry};
use tracing::{debug, info};

impl SyncContext {
    /// Host a new game: the game row in `lobby` plus the host's roster entry.
    pub async fn create_game(&self, difficulty: Difficulty, puzzle: &str, solution: &str) -> Result<Game> {
        let user = self.current_user()?;
        Grid::parse(puzzle)?;
        Grid::parse(solution)?;

        let game = self
            .store()
            .insert_game(NewGame {
                host_user_id: user.id.clone(),
                difficulty,
                puzzle: puzzle.to_string(),
                solution: solution.to_string(),
            })
            .await?;
        self.store().insert_player(&game.id, &user.id).await?;

        info!("User {} hosted game {}", user.id, game.id);
        Ok(game)
    }

    /// Join a game. Joining twice returns the existing entry.
    pub async fn join_game(&self, game_id: &str) -> Result<RosterEntry> {
        let user = self.current_user()?;
        if self.store().get_game(game_id).await?.is_none() {
            return Err(SyncError::GameNotFound(game_id.to_string()));
        }

        if let Some(entry) = self.store().insert_player(game_id, &user.id).await? {
            info!("User {} joined game {}", user.id, game_id);
            return Ok(entry);
        }

        debug!("User {} already in game {}", user.id, game_id);
        self.store()
            .list_players(game_id)
            .await?
            .into_iter()
            .find(|p| p.user_id == user.id)
            .ok_or_else(|| SyncError::GameNotFound(game_id.to_string()))
    }

    /// Leave a game. The last player out deletes it.
    pub async fn leave_game(&self, game_id: &str) -> Result<Removal> {
        let user = self.current_user()?;
        let removal = self.store().remove_player(game_id, &user.id).await?;
        if removal.game_deleted {
            info!("Game {} deleted after its last player left", game_id);
        } else if removal.removed {
            info!("User {} left game {}", user.id, game_id);
        }
        Ok(removal)
    }

    /// Move a game from `lobby` to `active`. Returns whether this call made
    /// the transition; losing the race to another starter is still success.
    pub async fn start_game(&self, game_id: &str) -> Result<bool> {
        let started = self
            .store()
            .transition(game_id, GameStatus::Lobby, GameStatus::Active)
            .await?;
        if started {
            return Ok(true);
        }

        match self.store().get_game(game_id).await? {
            Some(_) => {
                debug!("Game {} already past the lobby", game_id);
                Ok(false)
            }
            None => Err(SyncError::GameNotFound(game_id.to_string())),
        }
    }

    /// Mark a game finished. Only the host may, and only with a solved grid.
    pub async fn finish_game(&self, game_id: &str, grid: &Grid) -> Result<bool> {
        let game = self.hosted_game(game_id).await?;
        if !grid.is_solved() {
            return Err(SyncError::NotSolved);
        }

        self.store()
            .transition(&game.id, GameStatus::Active, GameStatus::Finished)
            .await
    }

    /// Remove a game outright. Host only.
    pub async fn delete_game(&self, game_id: &str) -> Result<bool> {
        let game = self.hosted_game(game_id).await?;
        let deleted = self.store().delete_game(&game.id).await?;
        if deleted {
            info!("Game {} deleted by its host", game_id);
        }
        Ok(deleted)
    }

    /// Games currently in the configured directory status, newest first.
    pub async fn list_open_games(&self) -> Result<Vec<Game>> {
        self.store().list_games(self.config().directory_status).await
    }

    /// Change feed and initial load for the open-games directory.
    pub async fn watch_open_games(&self) -> Result<(OpenGames, ChangeFeed)> {
        let status = self.config().directory_status;
        let feed = self.store().watch(OpenGames::filter());
        let games = self.store().list_games(status).await?;
        Ok((OpenGames::new(status, games), feed))
    }

    /// Change feed and initial load for one game's roster.
    pub async fn watch_roster(&self, game_id: &str) -> Result<(Roster, ChangeFeed)> {
        let feed = self.store().watch(Roster::filter(game_id));
        let entries = self.store().list_players(game_id).await?;
        Ok((Roster::new(game_id, entries), feed))
    }

    async fn hosted_game(&self, game_id: &str) -> Result<Game> {
        let user = self.current_user()?;
        let game = self
            .store()
            .get_game(game_id)
            .await?
            .ok_or_else(|| SyncError::GameNotFound(game_id.to_string()))?;
        if game.host_user_id != user.id {
            return Err(SyncError::NotAuthorized(format!(
                "{} is not the host of {}",
                user.id, game_id
            )));
        }
        Ok(game)
    }
}

/// Local copy of one game's roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    game_id: String,
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(game_id: impl Into<String>, entries: Vec<RosterEntry>) -> Self {
        let game_id = game_id.into();
        let mut roster = Self {
            game_id,
            entries: Vec::new(),
        };
        for entry in entries {
            roster.add(entry);
        }
        roster
    }

    pub fn filter(game_id: &str) -> ChangeFilter {
        ChangeFilter::new(Table::Players).eq("game_id", game_id)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.iter().any(|e| e.user_id == user_id)
    }

    fn add(&mut self, entry: RosterEntry) -> bool {
        if entry.game_id != self.game_id || self.contains(&entry.user_id) {
            return false;
        }
        self.entries.push(entry);
        self.entries.sort_by_key(|e| e.joined_at);
        true
    }

    /// Replace the entries with a fresh load, after the feed lagged.
    /// Returns whether the roster changed.
    pub fn reset(&mut self, entries: Vec<RosterEntry>) -> bool {
        let fresh = Roster::new(self.game_id.clone(), entries);
        if fresh.entries == self.entries {
            return false;
        }
        self.entries = fresh.entries;
        true
    }

    /// Apply one feed delivery, reloading from the store on lag. Returns
    /// whether the roster changed.
    pub async fn update(&mut self, ctx: &SyncContext, item: FeedItem) -> Result<bool> {
        match item {
            FeedItem::Change(change) => Ok(self.apply(&change)),
            FeedItem::Lagged(_) => {
                let entries = ctx.store().list_players(&self.game_id).await?;
                Ok(self.reset(entries))
            }
        }
    }

    /// Apply one store change. Returns whether the roster changed.
    pub fn apply(&mut self, change: &Change) -> bool {
        match (change.kind, &change.new, &change.old) {
            (ChangeKind::Insert, Some(Row::Player(entry)), _) => self.add(entry.clone()),
            (ChangeKind::Delete, _, Some(Row::Player(entry))) => {
                let before = self.entries.len();
                self.entries
                    .retain(|e| !(e.game_id == entry.game_id && e.user_id == entry.user_id));
                self.entries.len() != before
            }
            _ => false,
        }
    }
}

/// Local copy of the open-games directory, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenGames {
    status: GameStatus,
    games: Vec<Game>,
}

impl OpenGames {
    pub fn new(status: GameStatus, games: Vec<Game>) -> Self {
        let mut open = Self {
            status,
            games: Vec::new(),
        };
        for game in games {
            open.upsert(game);
        }
        open
    }

    /// Every game change; rows leaving the status are seen through `old`.
    pub fn filter() -> ChangeFilter {
        ChangeFilter::new(Table::Games)
    }

    pub fn games(&self) -> &[Game] {
        &self.games
    }

    pub fn get(&self, game_id: &str) -> Option<&Game> {
        self.games.iter().find(|g| g.id == game_id)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    fn upsert(&mut self, game: Game) -> bool {
        if game.status != self.status {
            return self.remove(&game.id);
        }
        self.games.retain(|g| g.id != game.id);
        self.games.push(game);
        self.games.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        true
    }

    fn remove(&mut self, game_id: &str) -> bool {
        let before = self.games.len();
        self.games.retain(|g| g.id != game_id);
        self.games.len() != before
    }

    /// Replace the list with a fresh load, after the feed lagged.
    pub fn reset(&mut self, games: Vec<Game>) -> bool {
        let fresh = OpenGames::new(self.status, games);
        if fresh.games == self.games {
            return false;
        }
        self.games = fresh.games;
        true
    }

    /// Apply one feed delivery, reloading from the store on lag. Returns
    /// whether the directory changed.
    pub async fn update(&mut self, ctx: &SyncContext, item: FeedItem) -> Result<bool> {
        match item {
            FeedItem::Change(change) => Ok(self.apply(&change)),
            FeedItem::Lagged(_) => {
                let games = ctx.store().list_games(self.status).await?;
                Ok(self.reset(games))
            }
        }
    }

    /// Apply one store change. Returns whether the directory changed.
    pub fn apply(&mut self, change: &Change) -> bool {
        match (change.kind, &change.new, &change.old) {
            (ChangeKind::Insert | ChangeKind::Update, Some(Row::Game(game)), _) => {
                self.upsert(game.clone())
            }
            (ChangeKind::Delete, _, Some(Row::Game(game))) => self.remove(&game.id),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticIdentity;
    use crate::hub::LocalHub;
    use crate::memory::MemoryStore;
    use crate::types::{SyncConfig, User};
    use std::sync::Arc;

    const PUZZLE: &str =
        "53--7----6--195----98----6-8---6---34--8-3--17---2---6-6----28----419--5----8--79";
    const SOLUTION: &str =
        "534678912672195348198342567859761423426853791713924856961537284287419635345286179";

    fn context(store: &MemoryStore, user: &str) -> SyncContext {
        SyncContext::new(
            Arc::new(store.clone()),
            Arc::new(LocalHub::new()),
            Arc::new(StaticIdentity::new(User::new(user, user))),
            SyncConfig::default(),
        )
    }

    fn game(id: &str, status: GameStatus, updated_at: u64) -> Game {
        Game {
            id: id.to_string(),
            host_user_id: "host".to_string(),
            status,
            difficulty: Difficulty::Easy,
            givens: PUZZLE.to_string(),
            puzzle: PUZZLE.to_string(),
            solution: SOLUTION.to_string(),
            created_at: 0,
            updated_at,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn create_game_adds_host_to_roster() {
        let store = MemoryStore::new();
        let host = context(&store, "alice");
        let game = host.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();

        assert_eq!(game.status, GameStatus::Lobby);
        assert_eq!(game.host_user_id, "alice");
        let players = store.list_players(&game.id).await.unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].user_id, "alice");
    }

    #[tokio::test]
    async fn create_game_rejects_bad_puzzle() {
        let store = MemoryStore::new();
        let host = context(&store, "alice");
        let err = host.create_game(Difficulty::Easy, "123", SOLUTION).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedPuzzle(_)));
        assert!(store.list_games(GameStatus::Lobby).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn anonymous_caller_is_rejected() {
        let store = MemoryStore::new();
        let ctx = context(&store, "alice").with_identity(Arc::new(StaticIdentity::anonymous()));
        let err = ctx.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap_err();
        assert!(matches!(err, SyncError::NotSignedIn));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let store = MemoryStore::new();
        let game = context(&store, "alice")
            .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
            .await
            .unwrap();
        let bob = context(&store, "bob");

        let first = bob.join_game(&game.id).await.unwrap();
        let second = bob.join_game(&game.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_players(&game.id).await.unwrap(), 2);

        let err = bob.join_game("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::GameNotFound(_)));
    }

    #[tokio::test]
    async fn last_leave_deletes_game() {
        let store = MemoryStore::new();
        let alice = context(&store, "alice");
        let bob = context(&store, "bob");
        let game = alice.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();
        bob.join_game(&game.id).await.unwrap();

        let removal = alice.leave_game(&game.id).await.unwrap();
        assert!(removal.removed);
        assert!(!removal.game_deleted);
        assert!(store.get_game(&game.id).await.unwrap().is_some());

        let removal = bob.leave_game(&game.id).await.unwrap();
        assert!(removal.game_deleted);
        assert!(store.get_game(&game.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_start_is_noop_success() {
        let store = MemoryStore::new();
        let alice = context(&store, "alice");
        let bob = context(&store, "bob");
        let game = alice.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();

        let (a, b) = tokio::join!(alice.start_game(&game.id), bob.start_game(&game.id));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b);

        let stored = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Active);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn finish_requires_host_and_solved_grid() {
        let store = MemoryStore::new();
        let alice = context(&store, "alice");
        let bob = context(&store, "bob");
        let game = alice.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();
        alice.start_game(&game.id).await.unwrap();

        let unsolved = Grid::parse(PUZZLE).unwrap();
        let solved = Grid::parse(SOLUTION).unwrap();

        let err = alice.finish_game(&game.id, &unsolved).await.unwrap_err();
        assert!(matches!(err, SyncError::NotSolved));
        let err = bob.finish_game(&game.id, &solved).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthorized(_)));

        assert!(alice.finish_game(&game.id, &solved).await.unwrap());
        let stored = store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Finished);
    }

    #[tokio::test]
    async fn only_host_deletes() {
        let store = MemoryStore::new();
        let alice = context(&store, "alice");
        let bob = context(&store, "bob");
        let game = alice.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();

        tokio_test::assert_err!(bob.delete_game(&game.id).await);
        assert!(alice.delete_game(&game.id).await.unwrap());
        assert!(store.get_game(&game.id).await.unwrap().is_none());
    }

    #[test]
    fn open_games_follow_status() {
        let mut open = OpenGames::new(
            GameStatus::Active,
            vec![game("a", GameStatus::Active, 1), game("b", GameStatus::Lobby, 2)],
        );
        assert_eq!(open.len(), 1);

        assert!(open.apply(&Change::update(
            Row::Game(game("b", GameStatus::Lobby, 2)),
            Row::Game(game("b", GameStatus::Active, 3)),
        )));
        assert_eq!(open.games()[0].id, "b");

        // leaving the filtered set drops it at once
        assert!(open.apply(&Change::update(
            Row::Game(game("a", GameStatus::Active, 1)),
            Row::Game(game("a", GameStatus::Finished, 4)),
        )));
        assert!(open.get("a").is_none());

        assert!(open.apply(&Change::delete(Row::Game(game("b", GameStatus::Active, 3)))));
        assert!(open.is_empty());
    }

    #[test]
    fn roster_ignores_other_games() {
        let mut roster = Roster::new("g1", Vec::new());
        let other = RosterEntry {
            game_id: "g2".to_string(),
            user_id: "alice".to_string(),
            joined_at: 1,
        };
        assert!(!roster.apply(&Change::insert(Row::Player(other))));

        let mine = RosterEntry {
            game_id: "g1".to_string(),
            user_id: "alice".to_string(),
            joined_at: 1,
        };
        assert!(roster.apply(&Change::insert(Row::Player(mine.clone()))));
        assert!(!roster.apply(&Change::insert(Row::Player(mine.clone()))));
        assert!(roster.apply(&Change::delete(Row::Player(mine))));
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn roster_reloads_after_lag() {
        let store = MemoryStore::new();
        let host = context(&store, "alice");
        let game = host.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await.unwrap();
        let mut roster = Roster::new(game.id.clone(), Vec::new());

        store.insert_player(&game.id, "bob").await.unwrap();
        assert!(roster.update(&host, FeedItem::Lagged(2)).await.unwrap());
        assert!(roster.contains("alice"));
        assert!(roster.contains("bob"));

        // same contents, no change reported
        assert!(!roster.update(&host, FeedItem::Lagged(1)).await.unwrap());
    }
}
