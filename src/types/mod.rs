//! Identifier newtypes shared by the cache modules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Statically assigned shard of the keyspace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Per-partition monotonic counter value; orders transactions and checkpoints.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

/// Process-unique identity of a cached row entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RowId(pub u64);

impl SequenceNumber {
    /// Returns the following sequence number.
    pub fn next(self) -> Self {
        SequenceNumber(self.0 + 1)
    }
}

impl PartitionId {
    /// Index of this partition inside a deduplication vector.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(value: PartitionId) -> Self {
        value.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        SequenceNumber(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}
