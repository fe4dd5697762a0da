//! Moves: one player's intent to set or clear one cell
//!
//! Moves are applied the same way whether they were authored locally,
//! broadcast by a peer or read back from the durable log: fixed cells are
//! never touched, re-applying an identical move changes nothing, and two
//! moves on the same cell resolve to whichever was applied last.

use crate::error::{Result, SyncError};
use crate::grid::{check_position, check_value, Grid, EMPTY_MARKER};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Broadcast event name carrying a cell edit
pub const CELL_UPDATE_EVENT: &str = "cell-update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub row: usize,
    pub col: usize,
    pub value: Option<u8>,
    pub author: String,
    /// Author's wall clock in ms when the edit was made
    pub at: u64,
}

impl Move {
    /// Build a move, validating its shape.
    pub fn new(row: usize, col: usize, value: Option<u8>, author: impl Into<String>, at: u64) -> Result<Self> {
        check_position(row, col)?;
        check_value(value)?;
        Ok(Self {
            row,
            col,
            value,
            author: author.into(),
            at,
        })
    }

    /// Whether two moves address the same cell.
    pub fn same_cell(&self, other: &Move) -> bool {
        self.row == other.row && self.col == other.col
    }

    /// Apply to `grid`. Returns whether the grid changed.
    pub fn apply(&self, grid: &mut Grid) -> Result<bool> {
        grid.set(self.row, self.col, self.value)
    }

    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(CellUpdate {
            r: self.row as i64,
            c: self.col as i64,
            v: self.value.map(|v| v.to_string()).unwrap_or_default(),
            author: self.author.clone(),
            at: self.at,
        })?)
    }

    /// Decode a broadcast payload. Anything that is not a well-formed edit is
    /// rejected here and never reaches the grid.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        let update: CellUpdate =
            serde_json::from_value(payload).map_err(|e| SyncError::MalformedMove(e.to_string()))?;
        update.try_into()
    }
}

/// Wire shape of a cell edit. `v` is a digit, or empty (or `-`) for a clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellUpdate {
    pub r: i64,
    pub c: i64,
    pub v: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub at: u64,
}

impl TryFrom<CellUpdate> for Move {
    type Error = SyncError;

    fn try_from(update: CellUpdate) -> Result<Self> {
        let row = usize::try_from(update.r)
            .map_err(|_| SyncError::MalformedMove(format!("bad row {}", update.r)))?;
        let col = usize::try_from(update.c)
            .map_err(|_| SyncError::MalformedMove(format!("bad col {}", update.c)))?;

        let mut chars = update.v.chars();
        let value = match (chars.next(), chars.next()) {
            (None, _) => None,
            (Some(EMPTY_MARKER), None) => None,
            (Some(ch @ '1'..='9'), None) => Some(ch as u8 - b'0'),
            _ => return Err(SyncError::MalformedMove(format!("bad value {:?}", update.v))),
        };

        Move::new(row, col, value, update.author, update.at)
    }
}

/// A move as stored in the append-only log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedMove {
    /// Position in the log; strictly increasing per store
    pub seq: u64,
    pub game_id: String,
    #[serde(flatten)]
    pub mv: Move,
}

/// Rebuild a grid by applying `moves` in order on top of `baseline`.
///
/// Moves that target fixed cells or are out of shape are skipped.
pub fn replay<'a>(baseline: &Grid, moves: impl IntoIterator<Item = &'a Move>) -> Grid {
    let mut grid = baseline.clone();
    for mv in moves {
        if let Err(e) = mv.apply(&mut grid) {
            debug!("Skipping move during replay: {}", e);
        }
    }
    grid
}

/// Tracks how far into the durable log a grid has been brought, so each log
/// entry is applied exactly once even when the change feed re-delivers it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogPosition {
    last_seq: u64,
}

impl LogPosition {
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Record `seq` as applied. Returns false if it was already covered.
    pub fn advance(&mut self, seq: u64) -> bool {
        if seq <= self.last_seq {
            return false;
        }
        self.last_seq = seq;
        true
    }
}
