//! Write-back status of a cached row relative to the last checkpoint.
//!
//! A row carries the *net* effect of all edits since the partition last
//! checkpointed, so a checkpoint emits at most one delta per row no matter
//! how many transactions touched it:
//!
//! | prior     | create    | update    | delete   |
//! |-----------|-----------|-----------|----------|
//! | `None`    | `Created` | `Updated` | `Deleted`|
//! | `Created` | -         | `Created` | `None`   |
//! | `Updated` | -         | `Updated` | `Deleted`|
//! | `Deleted` | `Updated` | -         | -        |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Write-back status of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Writeback {
    /// In-memory value equals the last persisted value.
    #[default]
    None,
    /// Row did not exist at the last checkpoint and exists now.
    Created,
    /// Row existed at the last checkpoint and has a different value now.
    Updated,
    /// Row existed at the last checkpoint and does not exist now.
    Deleted,
}

/// How a transition changes membership in the partition's writebacks set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyChange {
    /// Row becomes dirty and must be added.
    Insert,
    /// Row became clean and must be removed.
    Remove,
    /// Membership is unchanged.
    Keep,
}

impl Writeback {
    /// Returns true if the row belongs in the writebacks set.
    pub fn is_dirty(self) -> bool {
        self != Writeback::None
    }

    /// Status after the row is created.
    pub fn after_create(self) -> (Writeback, DirtyChange) {
        match self {
            Writeback::Deleted => (Writeback::Updated, DirtyChange::Keep),
            prior => (Writeback::Created, prior.joined()),
        }
    }

    /// Status after the row's value is replaced.
    pub fn after_update(self) -> (Writeback, DirtyChange) {
        match self {
            Writeback::Created => (Writeback::Created, DirtyChange::Keep),
            prior => (Writeback::Updated, prior.joined()),
        }
    }

    /// Status after the row is deleted.
    pub fn after_delete(self) -> (Writeback, DirtyChange) {
        match self {
            Writeback::Created => (Writeback::None, DirtyChange::Remove),
            prior => (Writeback::Deleted, prior.joined()),
        }
    }

    fn joined(self) -> DirtyChange {
        if self.is_dirty() {
            DirtyChange::Keep
        } else {
            DirtyChange::Insert
        }
    }

    /// Short lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Writeback::None => "none",
            Writeback::Created => "created",
            Writeback::Updated => "updated",
            Writeback::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Writeback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
