//! Low-level primitives the cache is built on.

/// Concurrency primitives and synchronization.
///
/// Holder-identified locks with FIFO hand-off for partition serialization.
pub mod concurrency;
