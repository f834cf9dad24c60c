//! Optimistic-concurrency persistence for pool state.

use async_trait::async_trait;

use crate::core::SchedulerError;
use crate::util::serde::PoolId;

/// A stored blob and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Monotonic version; the first write of a pool is version 1. Versions
    /// are never reused for a pool id, even after it is deleted and created
    /// again.
    pub version: u64,
    /// Encoded `SchedulerState`.
    pub blob: Vec<u8>,
}

/// Versioned blob store holding one document per pool.
///
/// All writers, in this process or elsewhere, go through
/// [`NodeStore::compare_and_swap`]; no locks are held across calls.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Current document of a pool, `None` if the pool does not exist.
    async fn load(&self, pool: &str) -> Result<Option<Versioned>, SchedulerError>;

    /// Write `blob` if the stored version still equals `expected` (`None`
    /// meaning "must not exist yet"). Returns the new version, or
    /// [`SchedulerError::Conflict`] when another writer got there first.
    async fn compare_and_swap(
        &self,
        pool: &str,
        expected: Option<u64>,
        blob: Vec<u8>,
    ) -> Result<u64, SchedulerError>;

    /// Remove a pool's document. Returns whether it existed. The last version
    /// is remembered so a writer holding it can never land on a recreated pool.
    async fn delete(&self, pool: &str) -> Result<bool, SchedulerError>;

    /// Ids of every stored pool, sorted.
    async fn list_pools(&self) -> Result<Vec<PoolId>, SchedulerError>;
}
