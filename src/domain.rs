//! Shared domain types: the ledger row and the migration direction.

use chrono::NaiveDateTime;
use serde::Serialize;

/// A row of the ledger table `public.tmigration`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub is_applied: bool,
    pub update_at: NaiveDateTime,
}

/// Direction of a migration batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// The boolean the ledger stores in `is_applied` when this direction
    /// commits. Also the `$2` parameter of the reservation statement.
    pub fn is_up(self) -> bool {
        matches!(self, Direction::Up)
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Up => "Up",
            Direction::Down => "Down",
        }
    }
}
