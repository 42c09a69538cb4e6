//! Plan filter: decides which discovered migrations are in scope.
//!
//! The filter is a pure predicate over the ledger snapshot taken at batch
//! start. `exclude` holds the ledger rows already in the target state,
//! `recent` the highest applied migration, and `request_to_version` an
//! optional user-supplied boundary. The orchestrator sets either the
//! boundary or `recent`, never both.

use std::collections::HashMap;

use crate::domain::{Direction, Migration};
use crate::loader::RawMigration;

#[derive(Debug, Default)]
pub struct Filter {
    pub exclude: HashMap<u64, Migration>,
    pub recent: Option<Migration>,
    pub request_to_version: Option<u64>,
}

impl Filter {
    /// A migration whose `(version, name)` matches an excluded ledger row is
    /// never part of the plan.
    pub fn is_excluded(&self, migration: &RawMigration) -> bool {
        self.exclude
            .get(&migration.version)
            .is_some_and(|excluded| excluded.name == migration.name)
    }

    pub fn allows(&self, migration: &RawMigration, direction: Direction) -> bool {
        match direction {
            Direction::Up => self.allow_up(migration),
            Direction::Down => self.allow_down(migration),
        }
    }

    /// Up: with a target, only versions up to and including it; otherwise
    /// only versions above the most recently applied one.
    fn allow_up(&self, migration: &RawMigration) -> bool {
        match self.request_to_version {
            Some(target) => migration.version <= target,
            None => self
                .recent
                .as_ref()
                .is_none_or(|recent| migration.version > recent.version),
        }
    }

    /// Down: with a target, only versions down to and including it;
    /// otherwise only versions at or below the most recently applied one.
    fn allow_down(&self, migration: &RawMigration) -> bool {
        match self.request_to_version {
            Some(target) => migration.version >= target,
            None => self
                .recent
                .as_ref()
                .is_none_or(|recent| migration.version <= recent.version),
        }
    }
}
