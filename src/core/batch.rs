//! Per-pool batch runner.
//!
//! Every pool has exactly one [`PoolActor`] owning the write path to its
//! stored state. Callers talk to it through a cloneable [`PoolHandle`]; the
//! actor folds whatever arrives within one coalescing window into a single
//! transition, commits it with a compare-and-swap, and answers every caller
//! from the committed result. A conflicting write reloads the state and
//! re-applies the same batch at the same batch time. Operations whose callers
//! gave up before the commit are left out and the rest is re-applied.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::core::audit::{build_audit_event, AuditSink};
use crate::core::decision::Decision;
use crate::core::node_store::NodeStore;
use crate::core::state::SchedulerState;
use crate::core::transition::{apply_batch, AssignmentView, OpOutcome, Operation};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::serde::PoolId;

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Shared, lockable audit sink.
pub type SharedAudit = Arc<Mutex<Box<dyn AuditSink>>>;

type Reply = oneshot::Sender<Result<OpOutcome, SchedulerError>>;

// Who decides the fate of a submission: the actor claims it right before a
// commit, the caller abandons it when its deadline passes first.
const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

struct Submission {
    op: Operation,
    deadline: Option<Instant>,
    claim: Arc<AtomicU8>,
    reply: Reply,
}

impl Submission {
    /// Whether the operation should still take part in a transition.
    fn is_live(&self, now: Instant) -> bool {
        if self.reply.is_closed() {
            return false;
        }
        match self.claim.load(Ordering::Acquire) {
            CLAIMED => true,
            PENDING => self.deadline.is_none_or(|d| d > now),
            _ => false,
        }
    }

    /// Take the outcome out of the caller's hands ahead of a commit. A
    /// claimed caller waits for the result even past its deadline.
    fn claim(&self, now: Instant) -> bool {
        self.is_live(now)
            && matches!(
                self.claim
                    .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire),
                Ok(_) | Err(CLAIMED)
            )
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("op", &self.op.name())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Reply to and remove every submission `keep` rejects.
fn answer_stale(
    batch: Vec<Submission>,
    mut keep: impl FnMut(&Submission) -> bool,
) -> (Vec<Submission>, usize) {
    let (live, stale): (Vec<_>, Vec<_>) = batch.into_iter().partition(|s| keep(s));
    let dropped = stale.len();
    for submission in stale {
        let _ = submission.reply.send(Err(SchedulerError::DeadlineExceeded));
    }
    (live, dropped)
}

/// Cloneable sender side of a pool actor.
#[derive(Clone, Debug)]
pub struct PoolHandle {
    pool: PoolId,
    tx: mpsc::Sender<Submission>,
    retired: Arc<AtomicBool>,
}

impl PoolHandle {
    /// Pool served by this handle.
    pub fn pool_id(&self) -> &str {
        &self.pool
    }

    /// Whether the actor behind this handle has stopped or was retired.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.retired.load(Ordering::Acquire)
    }

    /// Stop the actor once its current batch is done. Queued and later
    /// submissions fail with [`SchedulerError::UnknownPool`].
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Queue `op` for the pool's next batch and wait for it to commit.
    ///
    /// With a `timeout`, an operation the actor has not yet claimed for a
    /// commit when it expires is dropped and the caller gets
    /// [`SchedulerError::DeadlineExceeded`]; that error always means nothing
    /// was committed. Once claimed, the caller waits for the commit's result.
    pub async fn submit(
        &self,
        op: Operation,
        timeout: Option<Duration>,
    ) -> Result<OpOutcome, SchedulerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let claim = Arc::new(AtomicU8::new(PENDING));
        let (reply, mut reply_rx) = oneshot::channel();
        let submission = Submission {
            op,
            deadline,
            claim: Arc::clone(&claim),
            reply,
        };
        let stopped = |_| SchedulerError::Unavailable(format!("pool {} actor stopped", self.pool));
        let dropped = |_| SchedulerError::Unavailable(format!("pool {} dropped the batch", self.pool));

        let Some(deadline) = deadline else {
            self.tx.send(submission).await.map_err(stopped)?;
            return reply_rx.await.map_err(dropped)?;
        };
        tokio::time::timeout_at(deadline, self.tx.send(submission))
            .await
            .map_err(|_| SchedulerError::DeadlineExceeded)?
            .map_err(stopped)?;
        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(outcome) => outcome.map_err(dropped)?,
            Err(_) => {
                let abandoned = claim
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if abandoned {
                    return Err(SchedulerError::DeadlineExceeded);
                }
                reply_rx.await.map_err(dropped)?
            }
        }
    }
}

/// Single writer of one pool's stored state.
pub struct PoolActor {
    pool: PoolId,
    rx: mpsc::Receiver<Submission>,
    store: Arc<dyn NodeStore>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    audit: Option<SharedAudit>,
    retired: Arc<AtomicBool>,
    cached: Option<(u64, SchedulerState)>,
}

/// Start the actor for `pool` on `spawner` and return its handle. The actor
/// stops once every handle is dropped or one of them retires it.
pub fn spawn_pool_actor<S: Spawn>(
    spawner: &S,
    pool: &str,
    store: Arc<dyn NodeStore>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    audit: Option<SharedAudit>,
) -> PoolHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let retired = Arc::new(AtomicBool::new(false));
    let actor = PoolActor {
        pool: pool.to_string(),
        rx,
        store,
        clock,
        config,
        audit,
        retired: Arc::clone(&retired),
        cached: None,
    };
    spawner.spawn(actor.run());
    tracing::info!("pool {} actor started", pool);
    PoolHandle {
        pool: pool.to_string(),
        tx,
        retired,
    }
}

impl PoolActor {
    /// Serve batches until every handle is gone or the pool is retired.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let batch = self.collect(first).await;
            if self.is_retired() {
                self.stop(batch);
                break;
            }
            let batch_id = Uuid::new_v4().to_string();
            let span = tracing::info_span!(
                "batch",
                pool = %self.pool,
                batch_id = %batch_id,
                size = batch.len()
            );
            self.process(&batch_id, batch).instrument(span).await;
            if self.is_retired() {
                self.stop(Vec::new());
                break;
            }
        }
        tracing::info!("pool {} actor stopped", self.pool);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn stop(&mut self, mut batch: Vec<Submission>) {
        self.cached = None;
        self.rx.close();
        while let Ok(submission) = self.rx.try_recv() {
            batch.push(submission);
        }
        if !batch.is_empty() {
            fail_all(batch, &SchedulerError::UnknownPool(self.pool.clone()));
        }
    }

    async fn collect(&mut self, first: Submission) -> Vec<Submission> {
        let mut batch = vec![first];
        let window = tokio::time::sleep(self.config.window());
        tokio::pin!(window);
        while batch.len() < self.config.max_batch_size {
            tokio::select! {
                () = &mut window => break,
                next = self.rx.recv() => match next {
                    Some(submission) => batch.push(submission),
                    None => break,
                },
            }
        }
        batch
    }

    async fn current(&mut self) -> Result<(u64, SchedulerState), SchedulerError> {
        if let Some(cached) = self.cached.take() {
            return Ok(cached);
        }
        let stored = self
            .store
            .load(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::UnknownPool(self.pool.clone()))?;
        let state = SchedulerState::from_blob(&stored.blob)?;
        Ok((stored.version, state))
    }

    fn keep(&mut self, version: u64, state: SchedulerState) {
        if self.config.assume_sole_writer {
            self.cached = Some((version, state));
        }
    }

    async fn process(&mut self, batch_id: &str, mut batch: Vec<Submission>) {
        let now_ms = self.clock.now_ms();
        let mut attempt = 0u32;
        loop {
            if self.is_retired() {
                self.cached = None;
                return fail_all(batch, &SchedulerError::UnknownPool(self.pool.clone()));
            }
            let (live, _) = answer_stale(batch, |s| s.is_live(Instant::now()));
            batch = live;
            if batch.is_empty() {
                return;
            }

            let (version, mut state) = match self.current().await {
                Ok(loaded) => loaded,
                Err(err) => return fail_all(batch, &err),
            };
            let ops: Vec<Operation> = batch.iter().map(|s| s.op.clone()).collect();
            let report = apply_batch(&mut state, &ops, now_ms);
            let blob = match state.to_blob() {
                Ok(blob) => blob,
                Err(err) => return fail_all(batch, &err),
            };

            // everything written from here on is answered
            let (claimed, dropped) = answer_stale(batch, |s| s.claim(Instant::now()));
            batch = claimed;
            if dropped > 0 {
                tracing::debug!(dropped, "callers gave up before commit, re-applying batch");
                continue;
            }

            match self
                .store
                .compare_and_swap(&self.pool, Some(version), blob)
                .await
            {
                Ok(committed) => {
                    tracing::info!(
                        version = committed,
                        decisions = report.decisions.len(),
                        attempt,
                        "batch committed"
                    );
                    self.keep(committed, state);
                    self.record(batch_id, &report.decisions, now_ms);
                    let mut unseen = Vec::new();
                    for (submission, outcome) in batch.into_iter().zip(report.outcomes) {
                        if let Err(Ok(OpOutcome::Assignments(views))) = submission.reply.send(outcome)
                        {
                            unseen.extend(views);
                        }
                    }
                    if !unseen.is_empty() {
                        self.redeliver(unseen).await;
                    }
                    return;
                }
                Err(err @ SchedulerError::Conflict { .. }) => {
                    self.cached = None;
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::warn!("pool {} gave up after {} conflicts", self.pool, attempt);
                        return fail_all(
                            batch,
                            &SchedulerError::Unavailable(format!(
                                "pool {} kept conflicting: {err}",
                                self.pool
                            )),
                        );
                    }
                    tracing::debug!(%err, attempt, "conflict, re-applying batch");
                }
                Err(err) => {
                    self.cached = None;
                    return fail_all(batch, &err);
                }
            }
        }
    }

    /// Hand committed bindings whose poll reply never reached the worker out
    /// again on the worker's next poll instead of treating them as finished.
    async fn redeliver(&mut self, views: Vec<AssignmentView>) {
        for attempt in 0..=self.config.max_retries {
            let (version, mut state) = match self.current().await {
                Ok(loaded) => loaded,
                Err(err) => {
                    tracing::warn!(%err, "cannot reload to redeliver assignments");
                    return;
                }
            };
            let changed = views
                .iter()
                .filter(|v| state.undeliver(&v.worker_id, &v.request_id))
                .count();
            if changed == 0 {
                self.keep(version, state);
                return;
            }
            let blob = match state.to_blob() {
                Ok(blob) => blob,
                Err(err) => {
                    tracing::warn!(%err, "cannot encode redelivered assignments");
                    return;
                }
            };
            match self
                .store
                .compare_and_swap(&self.pool, Some(version), blob)
                .await
            {
                Ok(committed) => {
                    tracing::info!(version = committed, changed, "assignments marked for redelivery");
                    self.keep(committed, state);
                    return;
                }
                Err(SchedulerError::Conflict { .. }) => {
                    tracing::debug!(attempt, "conflict while marking redelivery");
                }
                Err(err) => {
                    tracing::warn!(%err, "cannot mark assignments for redelivery");
                    return;
                }
            }
        }
        tracing::warn!("pool {} could not mark {} assignments for redelivery", self.pool, views.len());
    }

    fn record(&self, batch_id: &str, decisions: &[Decision], now_ms: u128) {
        for decision in decisions {
            tracing::debug!(
                action = decision.action(),
                subject = decision.subject(),
                worker = decision.worker(),
                "decision"
            );
        }
        let Some(audit) = &self.audit else {
            return;
        };
        let mut sink = audit.lock();
        for (seq, decision) in decisions.iter().enumerate() {
            sink.record(build_audit_event(batch_id, seq, &self.pool, decision, now_ms));
        }
    }
}

fn fail_all(batch: Vec<Submission>, err: &SchedulerError) {
    tracing::warn!(%err, size = batch.len(), "batch failed");
    for submission in batch {
        let _ = submission.reply.send(Err(err.clone()));
    }
}
