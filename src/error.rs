//! Error types for sudoku-sync

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Malformed puzzle: {0}")]
    MalformedPuzzle(String),

    #[error("Malformed move: {0}")]
    MalformedMove(String),

    #[error("Cell ({row}, {col}) is fixed")]
    FixedCell { row: usize, col: usize },

    #[error("Game not found: {0}")]
    GameNotFound(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("No signed-in user")]
    NotSignedIn,

    #[error("Grid is not solved")]
    NotSolved,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Nostr error: {0}")]
    Nostr(String),

    #[error("Session closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used to decide how a caller reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad puzzle text or move payload; never applied.
    MalformedInput,
    /// A store or transport call failed; the next natural trigger may succeed.
    TransientIo,
    /// Lost a race against a concurrent writer or the row is gone.
    ConstraintRace,
    /// The operation is not allowed for this caller or state.
    Rejected,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::MalformedPuzzle(_)
            | SyncError::MalformedMove(_)
            | SyncError::Serialization(_) => ErrorKind::MalformedInput,
            SyncError::Store(_) | SyncError::Transport(_) | SyncError::Nostr(_) => {
                ErrorKind::TransientIo
            }
            SyncError::GameNotFound(_) => ErrorKind::ConstraintRace,
            SyncError::FixedCell { .. }
            | SyncError::NotAuthorized(_)
            | SyncError::NotSignedIn
            | SyncError::NotSolved
            | SyncError::Closed => ErrorKind::Rejected,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
