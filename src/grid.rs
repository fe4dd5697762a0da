//! Puzzle grid model and local validity checks
//!
//! A grid is a 9x9 matrix of cells. Its text form is 81 characters, row-major,
//! `'1'..='9'` for a digit and `'-'` for an empty cell. Cells present in the
//! puzzle text are *fixed* and can never be rewritten.

use crate::error::{Result, SyncError};
use std::fmt;
use std::str::FromStr;

pub const SIZE: usize = 9;
pub const CELLS: usize = SIZE * SIZE;
pub const EMPTY_MARKER: char = '-';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cell {
    pub value: Option<u8>,
    pub fixed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grid {
    cells: [[Cell; SIZE]; SIZE],
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            cells: [[Cell::default(); SIZE]; SIZE],
        }
    }
}

fn parse_char(ch: char) -> Option<Option<u8>> {
    match ch {
        EMPTY_MARKER => Some(None),
        '1'..='9' => Some(Some(ch as u8 - b'0')),
        _ => None,
    }
}

/// Check that `value` is empty or a digit 1-9.
pub fn check_value(value: Option<u8>) -> Result<()> {
    match value {
        None | Some(1..=9) => Ok(()),
        Some(v) => Err(SyncError::MalformedMove(format!("value {v} is not a digit 1-9"))),
    }
}

/// Check that `(row, col)` addresses a cell.
pub fn check_position(row: usize, col: usize) -> Result<()> {
    if row >= SIZE || col >= SIZE {
        return Err(SyncError::MalformedMove(format!(
            "cell ({row}, {col}) is outside the grid"
        )));
    }
    Ok(())
}

impl Grid {
    /// Parse puzzle text. Every digit becomes a fixed cell.
    pub fn parse(text: &str) -> Result<Self> {
        let count = text.chars().count();
        if count != CELLS {
            return Err(SyncError::MalformedPuzzle(format!(
                "expected {CELLS} characters, got {count}"
            )));
        }

        let mut grid = Grid::default();
        for (i, ch) in text.chars().enumerate() {
            let value = parse_char(ch).ok_or_else(|| {
                SyncError::MalformedPuzzle(format!("unexpected character {ch:?} at {i}"))
            })?;
            grid.cells[i / SIZE][i % SIZE] = Cell {
                value,
                fixed: value.is_some(),
            };
        }
        Ok(grid)
    }

    /// Rebuild a grid from the hosted puzzle text and a later snapshot of it.
    ///
    /// Fixedness comes from `givens` only. Where the snapshot disagrees with a
    /// given, the given wins.
    pub fn restore(givens: &str, snapshot: &str) -> Result<Self> {
        let mut grid = Grid::parse(givens)?;
        let current = Grid::parse(snapshot)?;
        for (row, col) in positions() {
            if !grid.cells[row][col].fixed {
                grid.cells[row][col].value = current.cells[row][col].value;
            }
        }
        Ok(grid)
    }

    /// Serialize to the 81-character text form.
    pub fn serialize(&self) -> String {
        self.cells
            .iter()
            .flatten()
            .map(|c| match c.value {
                Some(v) => (b'0' + v) as char,
                None => EMPTY_MARKER,
            })
            .collect()
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.cells.get(row).and_then(|r| r.get(col))
    }

    pub fn value(&self, row: usize, col: usize) -> Option<u8> {
        self.cell(row, col).and_then(|c| c.value)
    }

    pub fn rows(&self) -> &[[Cell; SIZE]; SIZE] {
        &self.cells
    }

    /// Write a value into a non-fixed cell.
    ///
    /// Returns whether the cell changed. No legality gate is applied: players may
    /// enter tentative digits that clash with their peers.
    pub fn set(&mut self, row: usize, col: usize, value: Option<u8>) -> Result<bool> {
        check_position(row, col)?;
        check_value(value)?;

        let cell = &mut self.cells[row][col];
        if cell.fixed {
            return Err(SyncError::FixedCell { row, col });
        }
        if cell.value == value {
            return Ok(false);
        }
        cell.value = value;
        Ok(true)
    }

    /// Whether `value` may go into `(row, col)` without repeating a digit in the
    /// same row, column or box. The target cell itself is not scanned. Clearing
    /// is always legal.
    pub fn is_legal(&self, row: usize, col: usize, value: Option<u8>) -> bool {
        let Some(v) = value else {
            return true;
        };
        if row >= SIZE || col >= SIZE {
            return false;
        }

        for i in 0..SIZE {
            if i != col && self.cells[row][i].value == Some(v) {
                return false;
            }
            if i != row && self.cells[i][col].value == Some(v) {
                return false;
            }
        }

        let (r0, c0) = (row / 3 * 3, col / 3 * 3);
        for r in r0..r0 + 3 {
            for c in c0..c0 + 3 {
                if (r != row || c != col) && self.cells[r][c].value == Some(v) {
                    return false;
                }
            }
        }
        true
    }

    /// Cells whose current value repeats a peer in its row, column or box.
    pub fn conflicts(&self) -> Vec<(usize, usize)> {
        positions()
            .filter(|&(r, c)| {
                let value = self.cells[r][c].value;
                value.is_some() && !self.is_legal(r, c, value)
            })
            .collect()
    }

    pub fn is_full(&self) -> bool {
        self.cells.iter().flatten().all(|c| c.value.is_some())
    }

    /// Every cell filled and none repeats a peer.
    pub fn is_solved(&self) -> bool {
        self.is_full() && positions().all(|(r, c)| self.is_legal(r, c, self.cells[r][c].value))
    }
}

/// All `(row, col)` pairs in row-major order.
pub fn positions() -> impl Iterator<Item = (usize, usize)> {
    (0..CELLS).map(|i| (i / SIZE, i % SIZE))
}

impl FromStr for Grid {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Grid::parse(s)
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOLVED: &str = "534678912672195348198342567859761423426853791713924856961537284287419635345286179";

    fn blank_with_five() -> String {
        let mut text = String::from("5");
        text.push_str(&"-".repeat(80));
        text
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(matches!(Grid::parse("123"), Err(SyncError::MalformedPuzzle(_))));
        assert!(matches!(
            Grid::parse(&"-".repeat(82)),
            Err(SyncError::MalformedPuzzle(_))
        ));
    }

    #[test]
    fn parse_rejects_foreign_characters() {
        let text = format!("0{}", "-".repeat(80));
        assert!(matches!(Grid::parse(&text), Err(SyncError::MalformedPuzzle(_))));
        let text = format!("{}.", "-".repeat(80));
        assert!(Grid::parse(&text).is_err());
    }

    #[test]
    fn parse_marks_givens_fixed() {
        let grid = Grid::parse(&blank_with_five()).unwrap();
        assert_eq!(grid.cell(0, 0), Some(&Cell { value: Some(5), fixed: true }));
        assert_eq!(grid.cell(0, 1), Some(&Cell { value: None, fixed: false }));
    }

    #[test]
    fn serialize_round_trips() {
        for text in [SOLVED.to_string(), blank_with_five(), "-".repeat(81)] {
            assert_eq!(Grid::parse(&text).unwrap().serialize(), text);
        }
    }

    #[test]
    fn legality_scenario_from_single_given() {
        let grid = Grid::parse(&blank_with_five()).unwrap();
        assert!(!grid.is_legal(0, 1, Some(5)));
        assert!(grid.is_legal(0, 1, Some(6)));
        assert!(grid.is_legal(0, 1, None));
    }

    #[test]
    fn legality_checks_column_and_box() {
        let grid = Grid::parse(&blank_with_five()).unwrap();
        assert!(!grid.is_legal(5, 0, Some(5)));
        assert!(!grid.is_legal(2, 2, Some(5)));
        assert!(grid.is_legal(4, 4, Some(5)));
        // the target cell is excluded from the scan
        assert!(grid.is_legal(0, 0, Some(5)));
    }

    #[test]
    fn solved_detection() {
        let grid = Grid::parse(SOLVED).unwrap();
        assert!(grid.is_solved());
        assert!(grid.conflicts().is_empty());

        // (0,1) overwritten with the digit already at (0,0)
        let mut broken = SOLVED.to_string();
        broken.replace_range(1..2, "5");
        let grid = Grid::parse(&broken).unwrap();
        assert!(!grid.is_solved());
        assert!(grid.conflicts().contains(&(0, 0)));
    }

    #[test]
    fn incomplete_grid_is_not_solved() {
        let mut text = SOLVED.to_string();
        text.replace_range(80..81, "-");
        let grid = Grid::parse(&text).unwrap();
        assert!(!grid.is_solved());
    }

    #[test]
    fn set_refuses_fixed_cells() {
        let mut grid = Grid::parse(&blank_with_five()).unwrap();
        assert!(matches!(
            grid.set(0, 0, Some(3)),
            Err(SyncError::FixedCell { row: 0, col: 0 })
        ));
        assert_eq!(grid.value(0, 0), Some(5));
    }

    #[test]
    fn set_accepts_illegal_digits() {
        let mut grid = Grid::parse(&blank_with_five()).unwrap();
        assert!(grid.set(0, 1, Some(5)).unwrap());
        assert_eq!(grid.value(0, 1), Some(5));
        assert!(!grid.set(0, 1, Some(5)).unwrap());
        assert_eq!(grid.conflicts(), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn set_validates_shape() {
        let mut grid = Grid::default();
        assert!(matches!(grid.set(9, 0, Some(1)), Err(SyncError::MalformedMove(_))));
        assert!(matches!(grid.set(0, 0, Some(0)), Err(SyncError::MalformedMove(_))));
        assert!(matches!(grid.set(0, 0, Some(10)), Err(SyncError::MalformedMove(_))));
    }

    #[test]
    fn restore_keeps_givens_fixed() {
        let givens = blank_with_five();
        let mut snapshot = givens.clone();
        snapshot.replace_range(1..2, "7");
        let grid = Grid::restore(&givens, &snapshot).unwrap();
        assert_eq!(grid.cell(0, 1), Some(&Cell { value: Some(7), fixed: false }));
        assert!(grid.cell(0, 0).unwrap().fixed);

        // a snapshot contradicting a given cannot overwrite it
        let mut bad = snapshot.clone();
        bad.replace_range(0..1, "9");
        let grid = Grid::restore(&givens, &bad).unwrap();
        assert_eq!(grid.value(0, 0), Some(5));
    }
}
