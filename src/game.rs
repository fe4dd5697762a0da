//! Game view driver
//!
//! A [`GameSession`] owns the local grid for one game and keeps it converged
//! with the other players. Local edits are applied first and then pushed out
//! through the configured [`ReplicationStrategy`]:
//!
//! - `Snapshot`: edits go out as `cell-update` broadcasts; the host persists
//!   the whole grid after a quiet period.
//! - `AppendLog`: edits are appended to the store's move log; every client
//!   applies log entries from the change feed exactly once, in log order.
//!
//! The host marks the game finished once its grid is solved.

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::grid::Grid;
use crate::moves::{self, LogPosition, LoggedMove, Move, CELL_UPDATE_EVENT};
use crate::replication::{Debouncer, SnapshotWriter};
use crate::store::{ChangeFeed, ChangeFilter, ChangeKind, FeedItem, Row, Store, Table};
use crate::transport::{release, Channel, ChannelEvent};
use crate::types::{grid_channel, now_ms, Game, GameStatus, ReplicationStrategy, User};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Events emitted by a game session
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// A cell changed; `remote` is false for our own edits
    CellChanged { mv: Move, remote: bool },
    /// The local grid is solved
    Solved,
    /// The game row moved to `finished`
    Finished,
    /// The game row is gone
    GameDeleted,
    /// Rebuilding the grid from the move log failed; the grid is at its baseline
    ReplayFailed(String),
    /// The grid was rebuilt from the store after the change feed fell behind
    Resynced,
    /// A background write failed
    Error(String),
}

struct Inner {
    ctx: SyncContext,
    game_id: String,
    user: User,
    is_host: bool,
    strategy: ReplicationStrategy,
    baseline: Grid,
    grid: Arc<RwLock<Grid>>,
    position: Mutex<LogPosition>,
    debouncer: Option<Debouncer>,
    solved: AtomicBool,
    event_tx: mpsc::Sender<GameEvent>,
}

impl Inner {
    async fn emit(&self, event: GameEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Apply a broadcast edit from a peer.
    async fn apply_remote(&self, mv: Move) {
        let changed = match mv.apply(&mut *self.grid.write().await) {
            Ok(changed) => changed,
            Err(e) => {
                debug!("Rejected remote move on game {}: {}", self.game_id, e);
                false
            }
        };
        if !changed {
            return;
        }

        if let Some(debouncer) = &self.debouncer {
            debouncer.touch();
        }
        self.emit(GameEvent::CellChanged { mv, remote: true }).await;
        self.check_solved().await;
    }

    /// Apply one log entry unless it is already covered.
    async fn apply_logged(&self, logged: LoggedMove) {
        let changed = {
            let mut position = self.position.lock().await;
            if !position.advance(logged.seq) {
                return;
            }
            match logged.mv.apply(&mut *self.grid.write().await) {
                Ok(changed) => changed,
                Err(e) => {
                    debug!("Skipping log entry {}: {}", logged.seq, e);
                    false
                }
            }
        };
        if !changed {
            return;
        }

        let remote = logged.mv.author != self.user.id;
        self.emit(GameEvent::CellChanged { mv: logged.mv, remote }).await;
        self.check_solved().await;
    }

    /// Rebuild the grid from the persisted state.
    async fn replay(&self) -> Result<()> {
        match self.strategy {
            ReplicationStrategy::AppendLog => {
                let mut position = self.position.lock().await;
                let log = self.ctx.store().list_moves(&self.game_id).await?;

                let rebuilt = moves::replay(&self.baseline, log.iter().map(|l| &l.mv));
                let mut next = LogPosition::default();
                for logged in &log {
                    next.advance(logged.seq);
                }
                *self.grid.write().await = rebuilt;
                *position = next;
                debug!("Replayed {} moves for game {}", log.len(), self.game_id);
            }
            ReplicationStrategy::Snapshot => {
                let game = self
                    .ctx
                    .store()
                    .get_game(&self.game_id)
                    .await?
                    .ok_or_else(|| SyncError::GameNotFound(self.game_id.clone()))?;
                *self.grid.write().await = Grid::restore(&game.givens, &game.puzzle)?;
                debug!("Reloaded snapshot for game {}", self.game_id);
            }
        }

        self.check_solved().await;
        Ok(())
    }

    async fn check_solved(&self) {
        let grid = self.grid.read().await.clone();
        if !grid.is_solved() {
            self.solved.store(false, Ordering::Release);
            return;
        }
        if self.solved.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Game {} solved", self.game_id);
        self.emit(GameEvent::Solved).await;
        self.finish(&grid).await;
    }

    /// Host only. A game still in the lobby is finished once it goes active.
    async fn finish(&self, grid: &Grid) {
        if !self.is_host {
            return;
        }
        if let Some(debouncer) = &self.debouncer {
            debouncer.flush_now().await;
        }
        match self.ctx.finish_game(&self.game_id, grid).await {
            Ok(true) => info!("Game {} finished", self.game_id),
            Ok(false) => debug!("Game {} was not active, not finishing", self.game_id),
            Err(e) => {
                warn!("Failed to finish game {}: {}", self.game_id, e);
                self.emit(GameEvent::Error(e.to_string())).await;
            }
        }
    }
}

/// Live view of one game's grid
pub struct GameSession {
    inner: Arc<Inner>,
    channel: Option<Arc<dyn Channel>>,
    event_rx: Arc<RwLock<mpsc::Receiver<GameEvent>>>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl GameSession {
    /// Load the game, rebuild the grid and start listening for peers.
    ///
    /// A failed log replay does not fail the open: the grid stays at the
    /// puzzle baseline and [`GameEvent::ReplayFailed`] is emitted. Call
    /// [`GameSession::replay`] to retry.
    pub async fn open(ctx: &SyncContext, game_id: &str) -> Result<Self> {
        let user = ctx.current_user()?;
        let game = ctx
            .store()
            .get_game(game_id)
            .await?
            .ok_or_else(|| SyncError::GameNotFound(game_id.to_string()))?;
        let is_host = game.host_user_id == user.id;
        let strategy = ctx.config().strategy;

        let baseline = Grid::parse(&game.givens)?;
        let start = match strategy {
            ReplicationStrategy::Snapshot => Grid::restore(&game.givens, &game.puzzle)?,
            ReplicationStrategy::AppendLog => baseline.clone(),
        };
        let grid = Arc::new(RwLock::new(start));

        let debouncer = (strategy == ReplicationStrategy::Snapshot && is_host).then(|| {
            let writer = SnapshotWriter::new(ctx.store().clone(), game.id.clone(), grid.clone());
            Debouncer::new(
                Arc::new(writer),
                Duration::from_millis(ctx.config().snapshot_debounce_ms),
            )
        });

        let (event_tx, event_rx) = mpsc::channel(ctx.config().event_capacity);
        let inner = Arc::new(Inner {
            ctx: ctx.clone(),
            game_id: game.id.clone(),
            user: user.clone(),
            is_host,
            strategy,
            baseline,
            grid,
            position: Mutex::new(LogPosition::default()),
            debouncer,
            solved: AtomicBool::new(false),
            event_tx,
        });

        let mut tasks = Vec::new();
        let status_feed = ctx
            .store()
            .watch(ChangeFilter::new(Table::Games).eq("id", game.id.clone()));
        tasks.push(spawn_status_listener(inner.clone(), game.status, status_feed));

        let channel = match strategy {
            ReplicationStrategy::Snapshot => {
                let sub = ctx
                    .transport()
                    .subscribe(&grid_channel(&game.id), &user.id)
                    .await?;
                tasks.push(spawn_broadcast_listener(inner.clone(), sub.events));
                Some(sub.channel)
            }
            ReplicationStrategy::AppendLog => {
                let feed = ctx.store().watch(
                    ChangeFilter::new(Table::Moves)
                        .event(ChangeKind::Insert)
                        .eq("game_id", game.id.clone()),
                );
                tasks.push(spawn_log_listener(inner.clone(), feed));

                if let Err(e) = inner.replay().await {
                    warn!("Failed to replay moves for game {}: {}", game.id, e);
                    *inner.grid.write().await = inner.baseline.clone();
                    inner.emit(GameEvent::ReplayFailed(e.to_string())).await;
                }
                None
            }
        };

        info!(
            "Opened game {} as {}{}",
            game.id,
            user.id,
            if is_host { " (host)" } else { "" }
        );

        Ok(Self {
            inner,
            channel,
            event_rx: Arc::new(RwLock::new(event_rx)),
            tasks,
            closed: AtomicBool::new(false),
        })
    }

    pub fn game_id(&self) -> &str {
        &self.inner.game_id
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn is_host(&self) -> bool {
        self.inner.is_host
    }

    pub fn strategy(&self) -> ReplicationStrategy {
        self.inner.strategy
    }

    /// Copy of the current grid
    pub async fn grid(&self) -> Grid {
        self.inner.grid.read().await.clone()
    }

    pub async fn value(&self, row: usize, col: usize) -> Option<u8> {
        self.inner.grid.read().await.value(row, col)
    }

    /// Whether `value` may go into the cell without clashing with a peer.
    pub async fn is_legal(&self, row: usize, col: usize, value: Option<u8>) -> bool {
        self.inner.grid.read().await.is_legal(row, col, value)
    }

    /// Cells whose current value clashes with a peer
    pub async fn conflicts(&self) -> Vec<(usize, usize)> {
        self.inner.grid.read().await.conflicts()
    }

    /// Set or clear a cell.
    ///
    /// The local grid changes first. If pushing the edit out fails, the local
    /// change stands and the error is returned. Returns whether the grid
    /// changed; an unchanged cell sends nothing.
    pub async fn set_cell(&self, row: usize, col: usize, value: Option<u8>) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }

        let mv = Move::new(row, col, value, self.inner.user.id.clone(), now_ms())?;
        let changed = mv.apply(&mut *self.inner.grid.write().await)?;
        if !changed {
            return Ok(false);
        }
        self.inner
            .emit(GameEvent::CellChanged {
                mv: mv.clone(),
                remote: false,
            })
            .await;

        let sent = self.propagate(mv).await;
        self.inner.check_solved().await;
        sent.map(|_| true)
    }

    async fn propagate(&self, mv: Move) -> Result<()> {
        match self.inner.strategy {
            ReplicationStrategy::Snapshot => {
                if let Some(debouncer) = &self.inner.debouncer {
                    debouncer.touch();
                }
                let channel = self.channel.as_ref().ok_or(SyncError::Closed)?;
                channel.broadcast(CELL_UPDATE_EVENT, mv.to_payload()?).await
            }
            ReplicationStrategy::AppendLog => {
                let logged = self.inner.ctx.store().append_move(&self.inner.game_id, mv).await?;
                debug!("Appended move {} to game {}", logged.seq, logged.game_id);
                Ok(())
            }
        }
    }

    /// Rebuild the grid from the store: the move log, or the saved snapshot.
    pub async fn replay(&self) -> Result<()> {
        self.inner.replay().await
    }

    /// Persist a pending snapshot now. No-op unless hosting a snapshot game.
    pub async fn flush(&self) {
        if let Some(debouncer) = &self.inner.debouncer {
            debouncer.flush_now().await;
        }
    }

    /// Try to receive an event (non-blocking)
    pub async fn try_recv(&self) -> Option<GameEvent> {
        self.event_rx.write().await.try_recv().ok()
    }

    /// Receive an event (blocking)
    pub async fn recv(&self) -> Option<GameEvent> {
        self.event_rx.write().await.recv().await
    }

    /// Flush pending writes, stop listening and leave the channel.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(debouncer) = &self.inner.debouncer {
            debouncer.shutdown().await;
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(channel) = &self.channel {
            release(channel.as_ref()).await?;
        }

        info!("Closed game {}", self.inner.game_id);
        Ok(())
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// =========================================================================
// Listeners
// =========================================================================

fn spawn_broadcast_listener(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let ChannelEvent::Broadcast { event, payload } = event else {
                continue;
            };
            if event != CELL_UPDATE_EVENT {
                continue;
            }
            match Move::from_payload(payload) {
                Ok(mv) => inner.apply_remote(mv).await,
                Err(e) => debug!("Ignoring malformed cell update: {}", e),
            }
        }
    })
}

fn spawn_log_listener(inner: Arc<Inner>, mut feed: ChangeFeed) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = feed.next().await {
            match item {
                FeedItem::Change(change) => {
                    if let Some(Row::Move(logged)) = change.new {
                        inner.apply_logged(logged).await;
                    }
                }
                // entries were dropped; the log itself is complete
                FeedItem::Lagged(_) => match inner.replay().await {
                    Ok(()) => inner.emit(GameEvent::Resynced).await,
                    Err(e) => {
                        warn!("Failed to resync game {}: {}", inner.game_id, e);
                        inner.emit(GameEvent::Error(e.to_string())).await;
                    }
                },
            }
        }
    })
}

fn spawn_status_listener(inner: Arc<Inner>, initial: GameStatus, mut feed: ChangeFeed) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status = initial;
        while let Some(item) = feed.next().await {
            let next = match item {
                FeedItem::Change(change) => match (change.kind, change.new) {
                    (ChangeKind::Delete, _) => None,
                    (ChangeKind::Update, Some(Row::Game(Game { status: next, .. }))) => Some(next),
                    _ => continue,
                },
                FeedItem::Lagged(_) => match inner.ctx.store().get_game(&inner.game_id).await {
                    Ok(game) => game.map(|g| g.status),
                    Err(e) => {
                        warn!("Failed to reload game {}: {}", inner.game_id, e);
                        continue;
                    }
                },
            };

            let Some(next) = next else {
                info!("Game {} was deleted", inner.game_id);
                inner.emit(GameEvent::GameDeleted).await;
                break;
            };
            if next == GameStatus::Finished && status != GameStatus::Finished {
                inner.emit(GameEvent::Finished).await;
            }
            if next == GameStatus::Active
                && status == GameStatus::Lobby
                && inner.solved.load(Ordering::Acquire)
            {
                let grid = inner.grid.read().await.clone();
                inner.finish(&grid).await;
            }
            status = next;
        }
    })
}
