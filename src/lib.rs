//! # sudoku-sync
//!
//! State synchronization for collaborative Sudoku. Several players edit one
//! grid at the same time, see each other's cursors, ready up in a lobby and
//! watch a shared directory of open games.
//!
//! ## Features
//!
//! - **Grid Model**: Parse, validate and serialize 81-cell grids
//! - **Replication**: Debounced host snapshots or a durable move log
//! - **Lobby**: Presence-derived readiness with a one-shot auto-start
//! - **Lifecycle**: Host, join, leave, start, finish and delete games
//! - **Cursors**: Throttled pointer broadcast with presence pruning
//! - **Transports**: In-process hub or Nostr relays
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sudoku_sync::{
//!     Difficulty, GameEvent, GameSession, LocalHub, LobbyEvent, LobbySession, MemoryStore,
//!     StaticIdentity, SyncConfig, SyncContext, User,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = SyncContext::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(LocalHub::new()),
//!         Arc::new(StaticIdentity::new(User::new("alice", "Alice"))),
//!         SyncConfig::new("my-sudoku"),
//!     );
//!
//!     let game = ctx.create_game(Difficulty::Easy, PUZZLE, SOLUTION).await?;
//!     let lobby = LobbySession::open(&ctx, &game.id).await?;
//!     lobby.toggle_ready().await?;
//!
//!     while let Some(event) = lobby.recv().await {
//!         if event == LobbyEvent::GameStarted {
//!             break;
//!         }
//!     }
//!     lobby.close().await?;
//!
//!     let session = GameSession::open(&ctx, &game.id).await?;
//!     session.set_cell(0, 2, Some(4)).await?;
//!
//!     while let Some(event) = session.recv().await {
//!         match event {
//!             GameEvent::CellChanged { mv, remote: true } => {
//!                 println!("{} set ({}, {})", mv.author, mv.row, mv.col);
//!             }
//!             GameEvent::Finished => break,
//!             _ => {}
//!         }
//!     }
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod context;
pub mod cursor;
pub mod error;
pub mod game;
pub mod grid;
pub mod hub;
pub mod lifecycle;
pub mod lobby;
pub mod memory;
pub mod moves;
pub mod presence;
pub mod replication;
pub mod store;
pub mod transport;
pub mod types;


pub use client::NostrClient;
pub use context::{IdentityProvider, StaticIdentity, SyncContext};
pub use cursor::{CursorOverlay, Position, PresentUser, RemoteCursor};
pub use error::{ErrorKind, Result, SyncError};
pub use game::{GameEvent, GameSession};
pub use grid::{Cell, Grid};
pub use hub::LocalHub;
pub use lifecycle::{OpenGames, Roster};
pub use lobby::{LobbyEvent, LobbySession};
pub use memory::MemoryStore;
pub use moves::Move;
pub use presence::{LobbyState, ReadyMap, StartLatch};
pub use store::{Change, ChangeFeed, ChangeFilter, ChangeKind, FeedItem, Store};
pub use transport::{Channel, ChannelEvent, PresenceSnapshot, Subscription, Transport};
pub use types::*;
