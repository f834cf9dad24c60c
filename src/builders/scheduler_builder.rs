//! Builder wiring configuration, persistence, clock and audit into a
//! [`Scheduler`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::core::{AuditSink, NodeStore, Scheduler, SchedulerError, SharedAudit, Spawn};
use crate::infra::MemoryNodeStore;
use crate::util::clock::{Clock, SystemClock};

/// Builder for [`Scheduler`]. Defaults to an in-memory store, the system
/// clock and no audit sink.
pub struct SchedulerBuilder<S: Spawn> {
    config: SchedulerConfig,
    spawner: S,
    store: Option<Arc<dyn NodeStore>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<SharedAudit>,
}

impl<S: Spawn> SchedulerBuilder<S> {
    /// Start from a configuration and the spawner pool actors run on.
    pub const fn new(config: SchedulerConfig, spawner: S) -> Self {
        Self {
            config,
            spawner,
            store: None,
            clock: None,
            audit: None,
        }
    }

    /// Configuration the scheduler will use.
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist pools in `store`.
    #[must_use]
    pub fn with_store(self, store: impl NodeStore + 'static) -> Self {
        self.with_shared_store(Arc::new(store))
    }

    /// Persist pools in a store shared with other components.
    #[must_use]
    pub fn with_shared_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Read batch time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Record committed decisions in `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: impl AuditSink + 'static) -> Self {
        let sink: Box<dyn AuditSink> = Box::new(sink);
        self.audit = Some(Arc::new(Mutex::new(sink)));
        self
    }

    /// Validate the configuration and assemble the scheduler.
    pub fn build(self) -> Result<Scheduler<S>, SchedulerError> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::InvalidRequest(format!("config invalid: {e}")))?;
        let store: Arc<dyn NodeStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryNodeStore::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        tracing::info!(
            window_ms = self.config.batch.window_ms,
            max_batch_size = self.config.batch.max_batch_size,
            "scheduler built"
        );
        Ok(Scheduler::new(
            self.config,
            store,
            clock,
            self.spawner,
            self.audit,
        ))
    }
}
