use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Configuration options supplied when creating a [`super::PipelinedCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Number of source partitions tracked by each deduplication vector.
    pub dedup_vector_len: usize,
    /// Lock waits longer than this many milliseconds are logged.
    pub slow_lock_wait_ms: u64,
    /// Thresholds that make a partition due for checkpointing.
    pub checkpoint: CheckpointPolicy,
}

/// Size and age thresholds for checkpoint collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointPolicy {
    /// Dirty rows that trigger a checkpoint.
    pub max_dirty_rows: usize,
    /// Queued post-checkpoint actions that trigger a checkpoint.
    pub max_pending_actions: usize,
    /// Age in milliseconds after which any pending work triggers a checkpoint.
    pub max_interval_ms: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            dedup_vector_len: 32,
            slow_lock_wait_ms: 250,
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            max_dirty_rows: 1024,
            max_pending_actions: 256,
            max_interval_ms: Some(10_000),
        }
    }
}

impl CheckpointPolicy {
    /// Maximum checkpoint age, if any.
    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms.map(Duration::from_millis)
    }
}

impl CacheOptions {
    /// Parses options from TOML text and validates them.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: CacheOptions =
            toml::from_str(text).map_err(|err| CacheError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| CacheError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects option combinations the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dedup_vector_len == 0 {
            return Err(CacheError::Config(
                "dedup_vector_len must be at least 1".into(),
            ));
        }
        if self.checkpoint.max_dirty_rows == 0 {
            return Err(CacheError::Config(
                "checkpoint.max_dirty_rows must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Sets the deduplication vector length.
    pub fn dedup_vector_len(mut self, len: usize) -> Self {
        self.dedup_vector_len = len;
        self
    }

    /// Sets the slow lock wait threshold.
    pub fn slow_lock_wait_ms(mut self, ms: u64) -> Self {
        self.slow_lock_wait_ms = ms;
        self
    }

    /// Sets the checkpoint policy.
    pub fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }

    /// Slow lock wait threshold as a duration.
    pub fn slow_lock_wait(&self) -> Duration {
        Duration::from_millis(self.slow_lock_wait_ms)
    }
}
