//! Per-pool scheduling policy. Persisted inside each pool's state so that every
//! writer of a pool applies the same policy.

use serde::{Deserialize, Serialize};

/// Default number of priority levels (0, 1, 2).
pub const DEFAULT_PRIORITY_LEVELS: usize = 3;

/// Upper bound on configurable priority levels.
pub const MAX_PRIORITY_LEVELS: usize = 16;

/// Where free (unfunded) requests rank relative to funded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeRanking {
    /// Every funded request outranks every free request, whatever the
    /// nominal priorities. A free P0 request waits behind a funded P2 one.
    #[default]
    AfterFunded,
    /// Free requests rank by nominal priority and lose only ties against
    /// funded requests at the same level. A free P0 request beats a
    /// funded P2 one.
    WithinPriority,
}

/// Policy knobs for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of priority levels; requests must use `0..priority_levels`.
    pub priority_levels: usize,
    /// Ranking of free requests against funded ones.
    pub free_ranking: FreeRanking,
    /// Whether waiting requests may evict strictly lower-ranked running ones.
    pub enable_preemption: bool,
    /// Idle workers not heard from for this long are forgotten before
    /// matching. `None` keeps them forever.
    pub idle_worker_ttl_ms: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            free_ranking: FreeRanking::default(),
            enable_preemption: true,
            idle_worker_ttl_ms: None,
        }
    }
}

impl PoolSettings {
    /// Validate pool settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.priority_levels == 0 {
            return Err("priority_levels must be greater than 0".into());
        }
        if self.priority_levels > MAX_PRIORITY_LEVELS {
            return Err(format!(
                "priority_levels must be at most {MAX_PRIORITY_LEVELS}"
            ));
        }
        if self.idle_worker_ttl_ms == Some(0) {
            return Err("idle_worker_ttl_ms must be greater than 0 when set".into());
        }
        Ok(())
    }
}
