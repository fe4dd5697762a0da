//! Lobby view driver
//!
//! A [`LobbySession`] joins the game's lobby channel, tracks the caller's
//! readiness there and follows the roster through the store's change feed.
//! Both streams feed a [`LobbyState`]; when every rostered player is ready the
//! session calls the start operation once, and reports the result.

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::lifecycle::Roster;
use crate::presence::{LobbyEffect, LobbyInput, LobbyState, ReadyMap};
use crate::store::{ChangeFeed, ChangeFilter, ChangeKind, FeedItem, Row, Store, Table};
use crate::transport::{release, Channel, ChannelEvent};
use crate::types::{lobby_channel, GameStatus, PresenceState, RosterEntry, User};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events emitted by a lobby session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    RosterChanged(Vec<RosterEntry>),
    ReadinessChanged(ReadyMap),
    /// The game is active; move to the game view
    GameStarted,
    /// Our start call failed; it is retried on the next readiness change
    StartFailed(String),
    GameDeleted,
}

#[derive(Clone)]
struct Driver {
    ctx: SyncContext,
    game_id: String,
    state: Arc<RwLock<LobbyState>>,
    event_tx: mpsc::Sender<LobbyEvent>,
    input_tx: mpsc::UnboundedSender<LobbyInput>,
}

impl Driver {
    async fn handle(&self, input: LobbyInput) {
        let effects = self.state.write().await.apply(input);
        for effect in effects {
            match effect {
                LobbyEffect::RosterChanged(roster) => {
                    let _ = self.event_tx.send(LobbyEvent::RosterChanged(roster)).await;
                }
                LobbyEffect::ReadinessChanged(ready) => {
                    let _ = self.event_tx.send(LobbyEvent::ReadinessChanged(ready)).await;
                }
                LobbyEffect::StartGame => self.start(),
                LobbyEffect::GameStarted => {
                    info!("Game {} started", self.game_id);
                    let _ = self.event_tx.send(LobbyEvent::GameStarted).await;
                }
                LobbyEffect::StartFailed(reason) => {
                    let _ = self.event_tx.send(LobbyEvent::StartFailed(reason)).await;
                }
            }
        }
    }

    fn start(&self) {
        let ctx = self.ctx.clone();
        let game_id = self.game_id.clone();
        let input_tx = self.input_tx.clone();

        debug!("Everyone is ready, starting game {}", game_id);
        tokio::spawn(async move {
            let outcome = match ctx.start_game(&game_id).await {
                Ok(_) => LobbyInput::StartSucceeded,
                Err(e) => {
                    warn!("Failed to start game {}: {}", game_id, e);
                    LobbyInput::StartFailed(e.to_string())
                }
            };
            let _ = input_tx.send(outcome);
        });
    }
}

/// Live view of one game's lobby
pub struct LobbySession {
    ctx: SyncContext,
    game_id: String,
    user: User,
    channel: Arc<dyn Channel>,
    state: Arc<RwLock<LobbyState>>,
    own_ready: AtomicBool,
    event_rx: Arc<RwLock<mpsc::Receiver<LobbyEvent>>>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl LobbySession {
    /// Watch the roster, join the lobby channel and announce ourselves not
    /// ready.
    pub async fn open(ctx: &SyncContext, game_id: &str) -> Result<Self> {
        let user = ctx.current_user()?;
        let (roster, roster_feed) = ctx.watch_roster(game_id).await?;
        let status_feed = ctx
            .store()
            .watch(ChangeFilter::new(Table::Games).eq("id", game_id));
        let game = ctx
            .store()
            .get_game(game_id)
            .await?
            .ok_or_else(|| SyncError::GameNotFound(game_id.to_string()))?;

        let sub = ctx
            .transport()
            .subscribe(&lobby_channel(game_id), &user.id)
            .await?;
        let channel = sub.channel;

        let (event_tx, event_rx) = mpsc::channel(ctx.config().event_capacity);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(LobbyState::new(ctx.config().required_players)));
        let driver = Driver {
            ctx: ctx.clone(),
            game_id: game_id.to_string(),
            state: state.clone(),
            event_tx,
            input_tx: input_tx.clone(),
        };

        let _ = input_tx.send(LobbyInput::Roster(roster.entries().to_vec()));
        if game.status != GameStatus::Lobby {
            let _ = input_tx.send(LobbyInput::GameActivated);
        }

        let task = tokio::spawn(run(
            driver,
            channel.clone(),
            roster,
            roster_feed,
            status_feed,
            sub.events,
            input_rx,
        ));

        channel
            .track(PresenceState {
                user_id: user.id.clone(),
                display_name: user.display_name().to_string(),
                ready: false,
            })
            .await?;

        info!("Opened lobby of game {} as {}", game_id, user.id);
        Ok(Self {
            ctx: ctx.clone(),
            game_id: game_id.to_string(),
            user,
            channel,
            state,
            own_ready: AtomicBool::new(false),
            event_rx: Arc::new(RwLock::new(event_rx)),
            task,
            closed: AtomicBool::new(false),
        })
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Flip our readiness and republish it. Others see the change on their
    /// next presence sync. Returns the new flag.
    pub async fn toggle_ready(&self) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }

        let ready = !self.own_ready.load(Ordering::Acquire);
        self.channel
            .track(PresenceState {
                user_id: self.user.id.clone(),
                display_name: self.user.display_name().to_string(),
                ready,
            })
            .await?;
        self.own_ready.store(ready, Ordering::Release);
        debug!("User {} ready: {}", self.user.id, ready);
        Ok(ready)
    }

    /// Our readiness as last published
    pub fn is_self_ready(&self) -> bool {
        self.own_ready.load(Ordering::Acquire)
    }

    /// Readiness of a user as seen on the channel
    pub async fn is_ready(&self, user_id: &str) -> bool {
        self.state.read().await.is_ready(user_id)
    }

    pub async fn ready(&self) -> ReadyMap {
        self.state.read().await.ready().clone()
    }

    pub async fn roster(&self) -> Vec<RosterEntry> {
        self.state.read().await.roster().to_vec()
    }

    pub async fn is_started(&self) -> bool {
        self.state.read().await.is_started()
    }

    /// Try to receive an event (non-blocking)
    pub async fn try_recv(&self) -> Option<LobbyEvent> {
        self.event_rx.write().await.try_recv().ok()
    }

    /// Receive an event (blocking)
    pub async fn recv(&self) -> Option<LobbyEvent> {
        self.event_rx.write().await.recv().await
    }

    /// Leave the game, then close the lobby.
    pub async fn leave(&self) -> Result<()> {
        self.ctx.leave_game(&self.game_id).await?;
        self.close().await
    }

    /// Retract presence and stop listening.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.task.abort();
        release(self.channel.as_ref()).await?;
        info!("Closed lobby of game {}", self.game_id);
        Ok(())
    }
}

impl Drop for LobbySession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    driver: Driver,
    channel: Arc<dyn Channel>,
    mut roster: Roster,
    mut roster_feed: ChangeFeed,
    mut status_feed: ChangeFeed,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut inputs: mpsc::UnboundedReceiver<LobbyInput>,
) {
    loop {
        tokio::select! {
            Some(input) = inputs.recv() => driver.handle(input).await,

            Some(item) = roster_feed.next() => match roster.update(&driver.ctx, item).await {
                Ok(true) => driver.handle(LobbyInput::Roster(roster.entries().to_vec())).await,
                Ok(false) => {}
                Err(e) => warn!("Failed to reload roster of game {}: {}", driver.game_id, e),
            },

            Some(event) = events.recv() => {
                let snapshot = match event {
                    ChannelEvent::PresenceSync(snapshot) => snapshot,
                    ChannelEvent::PresenceJoin { .. } | ChannelEvent::PresenceLeave { .. } => {
                        channel.presence_state().await
                    }
                    ChannelEvent::Broadcast { .. } => continue,
                };
                driver.handle(LobbyInput::Presence(snapshot)).await;
            }

            Some(item) = status_feed.next() => {
                let status = match item {
                    FeedItem::Change(change) => match (change.kind, change.new) {
                        (ChangeKind::Delete, _) => None,
                        (ChangeKind::Update, Some(Row::Game(game))) => Some(game.status),
                        _ => continue,
                    },
                    FeedItem::Lagged(_) => match driver.ctx.store().get_game(&driver.game_id).await {
                        Ok(game) => game.map(|g| g.status),
                        Err(e) => {
                            warn!("Failed to reload game {}: {}", driver.game_id, e);
                            continue;
                        }
                    },
                };
                match status {
                    None => {
                        info!("Game {} was deleted", driver.game_id);
                        let _ = driver.event_tx.send(LobbyEvent::GameDeleted).await;
                        break;
                    }
                    Some(status) if status != GameStatus::Lobby => {
                        driver.handle(LobbyInput::GameActivated).await;
                    }
                    Some(_) => {}
                }
            }

            else => break,
        }
    }
}
