//! In-memory versioned node store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{NodeStore, SchedulerError, Versioned};
use crate::util::serde::PoolId;

#[derive(Debug, Default)]
struct Documents {
    live: BTreeMap<PoolId, Versioned>,
    /// Last version of each deleted pool; a recreated pool continues after it.
    retired: BTreeMap<PoolId, u64>,
}

/// Process-local store keeping one versioned blob per pool.
///
/// Clones share the same map, which lets tests run several schedulers
/// against one store the way separate processes would share a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    docs: Arc<Mutex<Documents>>,
}

impl MemoryNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a pool, without copying its blob.
    pub fn version(&self, pool: &str) -> Option<u64> {
        self.docs.lock().live.get(pool).map(|v| v.version)
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn load(&self, pool: &str) -> Result<Option<Versioned>, SchedulerError> {
        Ok(self.docs.lock().live.get(pool).cloned())
    }

    async fn compare_and_swap(
        &self,
        pool: &str,
        expected: Option<u64>,
        blob: Vec<u8>,
    ) -> Result<u64, SchedulerError> {
        let mut docs = self.docs.lock();
        let found = docs.live.get(pool).map(|v| v.version);
        if found != expected {
            return Err(SchedulerError::Conflict {
                pool: pool.to_string(),
                expected,
                found,
            });
        }
        let previous = found.or_else(|| docs.retired.get(pool).copied());
        let version = previous.map_or(1, |v| v + 1);
        docs.live.insert(pool.to_string(), Versioned { version, blob });
        Ok(version)
    }

    async fn delete(&self, pool: &str) -> Result<bool, SchedulerError> {
        let mut docs = self.docs.lock();
        let Some(removed) = docs.live.remove(pool) else {
            return Ok(false);
        };
        docs.retired.insert(pool.to_string(), removed.version);
        Ok(true)
    }

    async fn list_pools(&self) -> Result<Vec<PoolId>, SchedulerError> {
        Ok(self.docs.lock().live.keys().cloned().collect())
    }
}
