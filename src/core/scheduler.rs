//! Scheduler facade: the pool registry plus the external operations.
//!
//! Mutating calls are routed to the pool's batch actor, which is started on
//! first use and lives until the pool is deleted. Read-only queries skip the
//! actors and read a fresh snapshot from the node store, bounded by the
//! configured query timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{PoolSettings, SchedulerConfig};
use crate::core::batch::{spawn_pool_actor, PoolHandle, SharedAudit, Spawn};
use crate::core::ledger::AccountConfig;
use crate::core::node_store::{NodeStore, Versioned};
use crate::core::state::SchedulerState;
use crate::core::transition::{AssignmentView, IdleWorker, NewRequest, OpOutcome, Operation, WorkerEvent};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::sampling::Sampler;
use crate::util::serde::{AccountId, PoolId, RequestId};

/// An account as reported by [`Scheduler::list_accounts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    /// Account identifier.
    pub account_id: AccountId,
    /// Current configuration.
    pub config: AccountConfig,
    /// Balance per priority level, accrued up to the time of the query.
    pub balance: Vec<f64>,
    /// Running requests the account currently funds.
    pub fanout: u32,
}

/// Full pool snapshot for debugging. The shape is not a stable contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    /// Stored version the snapshot was read at.
    pub version: u64,
    /// Decoded state.
    pub state: SchedulerState,
}

/// Quota scheduler serving any number of independent pools.
pub struct Scheduler<S: Spawn> {
    config: SchedulerConfig,
    store: Arc<dyn NodeStore>,
    clock: Arc<dyn Clock>,
    spawner: S,
    sampler: Sampler,
    audit: Option<SharedAudit>,
    pools: RwLock<HashMap<PoolId, PoolHandle>>,
}

impl<S: Spawn> Scheduler<S> {
    /// Assemble a scheduler. Prefer [`crate::builders::SchedulerBuilder`].
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn NodeStore>,
        clock: Arc<dyn Clock>,
        spawner: S,
        audit: Option<SharedAudit>,
    ) -> Self {
        let sampler = config
            .callbacks
            .seed
            .map_or_else(Sampler::from_entropy, Sampler::seeded);
        Self {
            config,
            store,
            clock,
            spawner,
            sampler,
            audit,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Underlying node store.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Create an empty pool. `settings` defaults to the configured
    /// `default_pool`.
    pub async fn create_pool(
        &self,
        pool: &str,
        settings: Option<PoolSettings>,
    ) -> Result<(), SchedulerError> {
        if pool.is_empty() {
            return Err(SchedulerError::InvalidRequest("empty pool id".into()));
        }
        let settings = settings.unwrap_or_else(|| self.config.default_pool.clone());
        settings.validate().map_err(SchedulerError::InvalidRequest)?;
        let blob = SchedulerState::new(pool, settings).to_blob()?;
        match self.store.compare_and_swap(pool, None, blob).await {
            Ok(_) => {
                tracing::info!("pool {} created", pool);
                Ok(())
            }
            Err(SchedulerError::Conflict { .. }) => Err(SchedulerError::PoolExists(pool.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Replace a pool's settings.
    pub async fn update_pool(&self, pool: &str, settings: PoolSettings) -> Result<(), SchedulerError> {
        self.submit(pool, Operation::UpdatePool { settings }, None)
            .await
            .map(drop)
    }

    /// Delete a pool and retire its actor. Calls still queued on the old
    /// actor fail with [`SchedulerError::UnknownPool`].
    pub async fn delete_pool(&self, pool: &str) -> Result<(), SchedulerError> {
        let retired = self.pools.write().remove(pool);
        if let Some(handle) = retired {
            handle.retire();
        }
        if self.store.delete(pool).await? {
            tracing::info!("pool {} deleted", pool);
            Ok(())
        } else {
            Err(SchedulerError::UnknownPool(pool.to_string()))
        }
    }

    /// Clear workers, requests, assignments, cancellations and balances.
    pub async fn wipe_pool(&self, pool: &str) -> Result<(), SchedulerError> {
        self.submit(pool, Operation::Wipe, None).await.map(drop)
    }

    /// Create or reconfigure an account.
    pub async fn upsert_account(
        &self,
        pool: &str,
        account_id: &str,
        config: AccountConfig,
    ) -> Result<(), SchedulerError> {
        let op = Operation::UpsertAccount {
            account_id: account_id.to_string(),
            config,
        };
        self.submit(pool, op, None).await.map(drop)
    }

    /// Delete an account. Its waiting and running requests continue as free.
    pub async fn delete_account(&self, pool: &str, account_id: &str) -> Result<(), SchedulerError> {
        let op = Operation::DeleteAccount {
            account_id: account_id.to_string(),
        };
        self.submit(pool, op, None).await.map(drop)
    }

    /// Submit requests.
    pub async fn enqueue_requests(
        &self,
        pool: &str,
        requests: Vec<NewRequest>,
    ) -> Result<(), SchedulerError> {
        self.submit(pool, Operation::EnqueueRequests { requests }, None)
            .await
            .map(drop)
    }

    /// Withdraw requests; running ones are aborted on their workers.
    pub async fn cancel_requests(
        &self,
        pool: &str,
        request_ids: Vec<RequestId>,
    ) -> Result<(), SchedulerError> {
        self.submit(pool, Operation::CancelRequests { request_ids }, None)
            .await
            .map(drop)
    }

    /// Workers poll for work and receive their bindings.
    pub async fn assign_tasks(
        &self,
        pool: &str,
        workers: Vec<IdleWorker>,
    ) -> Result<Vec<AssignmentView>, SchedulerError> {
        match self
            .submit(pool, Operation::AssignTasks { workers }, None)
            .await?
        {
            OpOutcome::Assignments(views) => Ok(views),
            OpOutcome::Applied => Ok(Vec::new()),
        }
    }

    /// Workers report what they run.
    pub async fn notify_tasks(
        &self,
        pool: &str,
        events: Vec<WorkerEvent>,
    ) -> Result<(), SchedulerError> {
        self.submit(pool, Operation::NotifyTasks { events }, None)
            .await
            .map(drop)
    }

    /// Route any operation through the pool's batch actor, optionally bounded
    /// by a deadline.
    pub async fn submit(
        &self,
        pool: &str,
        op: Operation,
        timeout: Option<Duration>,
    ) -> Result<OpOutcome, SchedulerError> {
        let handle = self.handle(pool).await?;
        handle.submit(op, timeout).await
    }

    /// Request ids `worker_id` must stop.
    pub async fn get_cancellations(
        &self,
        pool: &str,
        worker_id: &str,
    ) -> Result<Vec<RequestId>, SchedulerError> {
        let (_, state) = self.read(pool).await?;
        Ok(state
            .reconciler
            .pending_cancellations(worker_id)
            .into_iter()
            .map(|e| e.request_id.clone())
            .collect())
    }

    /// A random sample of waiting and running request ids, for producers to
    /// check for staleness out of band.
    pub async fn get_callbacks(&self, pool: &str) -> Result<Vec<RequestId>, SchedulerError> {
        let (_, state) = self.read(pool).await?;
        let rates = &self.config.callbacks;
        let mut ids = self
            .sampler
            .sample(state.waiting.keys().cloned(), rates.waiting_sample_rate);
        ids.extend(
            self.sampler
                .sample(state.running.keys().cloned(), rates.running_sample_rate),
        );
        Ok(ids)
    }

    /// Accounts with balances accrued to now and their running fanout.
    pub async fn list_accounts(&self, pool: &str) -> Result<Vec<AccountSummary>, SchedulerError> {
        let (_, mut state) = self.read(pool).await?;
        state.advance(self.clock.now_ms());
        Ok(state
            .ledger
            .iter()
            .map(|account| AccountSummary {
                account_id: account.id.clone(),
                config: account.config.clone(),
                balance: account.balance.clone(),
                fanout: state.fanout(&account.id),
            })
            .collect())
    }

    /// Full snapshot of a pool, for humans.
    pub async fn inspect(&self, pool: &str) -> Result<Inspection, SchedulerError> {
        let (version, state) = self.read(pool).await?;
        Ok(Inspection { version, state })
    }

    /// Every stored pool.
    pub async fn list_pools(&self) -> Result<Vec<PoolId>, SchedulerError> {
        tokio::time::timeout(self.config.query_timeout(), self.store.list_pools())
            .await
            .map_err(|_| SchedulerError::DeadlineExceeded)?
    }

    async fn load(&self, pool: &str) -> Result<Versioned, SchedulerError> {
        tokio::time::timeout(self.config.query_timeout(), self.store.load(pool))
            .await
            .map_err(|_| SchedulerError::DeadlineExceeded)??
            .ok_or_else(|| SchedulerError::UnknownPool(pool.to_string()))
    }

    async fn read(&self, pool: &str) -> Result<(u64, SchedulerState), SchedulerError> {
        let stored = self.load(pool).await?;
        Ok((stored.version, SchedulerState::from_blob(&stored.blob)?))
    }

    async fn handle(&self, pool: &str) -> Result<PoolHandle, SchedulerError> {
        if let Some(handle) = self.pools.read().get(pool) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        self.load(pool).await?;
        let mut pools = self.pools.write();
        let handle = pools
            .entry(pool.to_string())
            .and_modify(|h| {
                if h.is_closed() {
                    *h = self.spawn(pool);
                }
            })
            .or_insert_with(|| self.spawn(pool));
        Ok(handle.clone())
    }

    fn spawn(&self, pool: &str) -> PoolHandle {
        spawn_pool_actor(
            &self.spawner,
            pool,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.batch.clone(),
            self.audit.clone(),
        )
    }
}

impl<S: Spawn> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("pools", &self.pools.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
