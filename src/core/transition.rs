//! One batch transition: apply every queued operation of a pool to a state
//! snapshot, then run the matcher once.
//!
//! Each operation is validated before it touches the state, so a rejected
//! operation leaves no trace while the rest of the batch still applies. The
//! whole function is a pure function of `(state, ops, now_ms)`; the batch
//! runner relies on that to re-apply a batch after a store conflict.

use serde::{Deserialize, Serialize};

use crate::config::PoolSettings;
use crate::core::decision::Decision;
use crate::core::ledger::AccountConfig;
use crate::core::matcher;
use crate::core::reconciler::{CancelAction, ReconcileEntry};
use crate::core::state::{Request, SchedulerState};
use crate::core::SchedulerError;
use crate::util::serde::{AccountId, Funding, LabelSet, Priority, RequestId, WorkerId};

/// A worker announcing it is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleWorker {
    /// Worker identifier.
    pub id: WorkerId,
    /// Current labels.
    #[serde(default)]
    pub labels: LabelSet,
}

/// Something a worker observed about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum WorkerEvent {
    /// The worker runs nothing.
    Idle {
        /// Worker.
        worker_id: WorkerId,
        /// Labels, when the worker re-advertises them.
        #[serde(default)]
        labels: Option<LabelSet>,
    },
    /// The worker is running `request_id`.
    Running {
        /// Worker.
        worker_id: WorkerId,
        /// Request it runs.
        request_id: RequestId,
    },
    /// The worker finished (or stopped) `request_id`.
    Completed {
        /// Worker.
        worker_id: WorkerId,
        /// Request it ran.
        request_id: RequestId,
    },
}

impl WorkerEvent {
    /// Reporting worker.
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Idle { worker_id, .. }
            | Self::Running { worker_id, .. }
            | Self::Completed { worker_id, .. } => worker_id,
        }
    }
}

/// A request submitted by a task producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    /// Request identifier; resubmitting a tracked id is a no-op.
    pub id: RequestId,
    /// Requested priority level.
    #[serde(default)]
    pub priority: Priority,
    /// Owning account, `None` for a free request.
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Labels a worker must carry.
    #[serde(default)]
    pub labels: LabelSet,
    /// Enqueue time; defaults to the batch time.
    #[serde(default)]
    pub enqueued_at_ms: Option<u128>,
}

/// A state-mutating operation routed through a pool's batch runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Operation {
    /// Workers poll for work.
    AssignTasks {
        /// Polling workers.
        workers: Vec<IdleWorker>,
    },
    /// Workers report their state.
    NotifyTasks {
        /// Reports.
        events: Vec<WorkerEvent>,
    },
    /// Producers submit requests.
    EnqueueRequests {
        /// New requests.
        requests: Vec<NewRequest>,
    },
    /// Producers withdraw requests.
    CancelRequests {
        /// Requests to cancel.
        request_ids: Vec<RequestId>,
    },
    /// Create or reconfigure an account.
    UpsertAccount {
        /// Account.
        account_id: AccountId,
        /// New configuration.
        config: AccountConfig,
    },
    /// Delete an account.
    DeleteAccount {
        /// Account.
        account_id: AccountId,
    },
    /// Replace pool settings.
    UpdatePool {
        /// New settings.
        settings: PoolSettings,
    },
    /// Clear the pool's dynamic state.
    Wipe,
}

impl Operation {
    /// Operation name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AssignTasks { .. } => "assign_tasks",
            Self::NotifyTasks { .. } => "notify_tasks",
            Self::EnqueueRequests { .. } => "enqueue_requests",
            Self::CancelRequests { .. } => "cancel_requests",
            Self::UpsertAccount { .. } => "upsert_account",
            Self::DeleteAccount { .. } => "delete_account",
            Self::UpdatePool { .. } => "update_pool",
            Self::Wipe => "wipe",
        }
    }
}

/// A binding as handed to a polling worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentView {
    /// Worker.
    pub worker_id: WorkerId,
    /// Request to run.
    pub request_id: RequestId,
    /// Requested priority.
    pub priority: Priority,
    /// Owning account.
    pub account_id: Option<AccountId>,
    /// Funding chosen for the run.
    pub funding: Funding,
}

/// Per-operation result of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpOutcome {
    /// Bindings for the workers that polled.
    Assignments(Vec<AssignmentView>),
    /// The operation was applied.
    Applied,
}

/// Result of applying a batch to a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// One entry per input operation, in order.
    pub outcomes: Vec<Result<OpOutcome, SchedulerError>>,
    /// Every change made, in order.
    pub decisions: Vec<Decision>,
}

/// Apply `ops` to `state` as one transition at time `now_ms`.
pub fn apply_batch(state: &mut SchedulerState, ops: &[Operation], now_ms: u128) -> BatchReport {
    let mut decisions = matcher::prepare(state, now_ms);
    let applied: Vec<Result<(), SchedulerError>> = ops
        .iter()
        .map(|op| {
            let result = apply_op(state, op, now_ms, &mut decisions);
            if let Err(err) = &result {
                tracing::debug!(pool = %state.pool_id, op = op.name(), %err, "operation rejected");
            }
            result
        })
        .collect();
    decisions.extend(matcher::run(state, now_ms));

    let outcomes = ops
        .iter()
        .zip(applied)
        .map(|(op, result)| {
            result.map(|()| match op {
                Operation::AssignTasks { workers } => {
                    OpOutcome::Assignments(deliver(state, workers))
                }
                _ => OpOutcome::Applied,
            })
        })
        .collect();
    BatchReport {
        outcomes,
        decisions,
    }
}

fn deliver(state: &mut SchedulerState, workers: &[IdleWorker]) -> Vec<AssignmentView> {
    let mut views = Vec::new();
    for idle in workers {
        let Some(assignment) = state
            .workers
            .get_mut(&idle.id)
            .and_then(|w| w.assignment.as_mut())
        else {
            continue;
        };
        assignment.delivered = true;
        views.push(AssignmentView {
            worker_id: idle.id.clone(),
            request_id: assignment.request.id.clone(),
            priority: assignment.request.priority,
            account_id: assignment.request.account_id.clone(),
            funding: assignment.funding,
        });
    }
    views
}

fn apply_op(
    state: &mut SchedulerState,
    op: &Operation,
    now_ms: u128,
    decisions: &mut Vec<Decision>,
) -> Result<(), SchedulerError> {
    match op {
        Operation::AssignTasks { workers } => {
            if workers.iter().any(|w| w.id.is_empty()) {
                return Err(SchedulerError::InvalidRequest("empty worker id".into()));
            }
            for idle in workers {
                release_idle(state, &idle.id, Some(idle.labels.clone()), false, now_ms, decisions);
            }
            Ok(())
        }
        Operation::NotifyTasks { events } => {
            if events.iter().any(|e| e.worker_id().is_empty()) {
                return Err(SchedulerError::InvalidRequest("empty worker id".into()));
            }
            for event in events {
                apply_event(state, event, now_ms, decisions);
            }
            Ok(())
        }
        Operation::EnqueueRequests { requests } => enqueue(state, requests, now_ms, decisions),
        Operation::CancelRequests { request_ids } => {
            for request_id in request_ids {
                cancel(state, request_id, now_ms, decisions);
            }
            Ok(())
        }
        Operation::UpsertAccount { account_id, config } => {
            if account_id.is_empty() {
                return Err(SchedulerError::InvalidRequest("empty account id".into()));
            }
            config.validate(state.settings.priority_levels)?;
            state
                .ledger
                .upsert(account_id, config.clone(), state.settings.priority_levels);
            decisions.push(Decision::AccountUpdated {
                account_id: account_id.clone(),
            });
            decisions.extend(matcher::reprioritize(state));
            Ok(())
        }
        Operation::DeleteAccount { account_id } => {
            if !state.ledger.remove(account_id) {
                return Err(SchedulerError::UnknownAccount(account_id.clone()));
            }
            decisions.push(Decision::AccountDeleted {
                account_id: account_id.clone(),
            });
            decisions.extend(matcher::reprioritize(state));
            Ok(())
        }
        Operation::UpdatePool { settings } => {
            update_pool(state, settings)?;
            decisions.push(Decision::PoolUpdated);
            decisions.extend(matcher::reprioritize(state));
            Ok(())
        }
        Operation::Wipe => {
            state.wipe();
            decisions.push(Decision::Wiped);
            Ok(())
        }
    }
}

/// Settle resolved cancellations: a stopped victim of a preemption goes back
/// to the waiting set, an aborted one is dropped.
fn settle(state: &mut SchedulerState, entries: Vec<ReconcileEntry>, decisions: &mut Vec<Decision>) {
    for entry in entries {
        tracing::debug!(
            pool = %state.pool_id,
            worker = %entry.worker_id,
            request = %entry.request_id,
            state = ?entry.state,
            "cancellation resolved"
        );
        let bound_here = state
            .assignment(&entry.worker_id)
            .is_some_and(|a| a.request.id == entry.request_id);
        decisions.push(Decision::Resolved {
            worker_id: entry.worker_id.clone(),
            request_id: entry.request_id.clone(),
            state: entry.state,
        });
        if !bound_here {
            continue;
        }
        let Some(assignment) = state.unbind(&entry.worker_id) else {
            continue;
        };
        match entry.action {
            CancelAction::Preempt { .. } => {
                decisions.push(Decision::Requeued {
                    request_id: assignment.request.id.clone(),
                });
                state.requeue(assignment.request);
            }
            CancelAction::Abort => decisions.push(Decision::Cancelled {
                request_id: assignment.request.id,
            }),
        }
    }
}

/// The worker runs nothing. Pending cancellations are resolved, a delivered
/// binding counts as finished and an undelivered one is kept for the next poll.
fn release_idle(
    state: &mut SchedulerState,
    worker_id: &str,
    labels: Option<LabelSet>,
    confirmed: bool,
    now_ms: u128,
    decisions: &mut Vec<Decision>,
) {
    state.touch_worker(worker_id, labels, now_ms);
    let entries = state.reconciler.resolve_worker(worker_id, confirmed);
    settle(state, entries, decisions);
    if state.assignment(worker_id).is_some_and(|a| a.delivered) {
        if let Some(done) = state.unbind(worker_id) {
            decisions.push(Decision::Completed {
                worker_id: Some(worker_id.to_string()),
                request_id: done.request.id,
            });
        }
    }
}

fn apply_event(
    state: &mut SchedulerState,
    event: &WorkerEvent,
    now_ms: u128,
    decisions: &mut Vec<Decision>,
) {
    match event {
        WorkerEvent::Idle { worker_id, labels } => {
            release_idle(state, worker_id, labels.clone(), true, now_ms, decisions);
        }
        WorkerEvent::Completed {
            worker_id,
            request_id,
        } => {
            state.touch_worker(worker_id, None, now_ms);
            let entries: Vec<ReconcileEntry> =
                state.reconciler.confirm(worker_id, request_id).into_iter().collect();
            for entry in &entries {
                decisions.push(Decision::Resolved {
                    worker_id: entry.worker_id.clone(),
                    request_id: entry.request_id.clone(),
                    state: entry.state,
                });
            }
            let finished = if state
                .assignment(worker_id)
                .is_some_and(|a| &a.request.id == request_id)
            {
                state.unbind(worker_id).is_some()
            } else {
                state.waiting.remove(request_id).is_some()
            };
            if finished {
                decisions.push(Decision::Completed {
                    worker_id: Some(worker_id.clone()),
                    request_id: request_id.clone(),
                });
            }
        }
        WorkerEvent::Running {
            worker_id,
            request_id,
        } => report_running(state, worker_id, request_id, now_ms, decisions),
    }
}

/// Reconcile a worker's claim that it runs `request_id` with what the pool
/// believes it runs.
fn report_running(
    state: &mut SchedulerState,
    worker_id: &str,
    request_id: &str,
    now_ms: u128,
    decisions: &mut Vec<Decision>,
) {
    state.touch_worker(worker_id, None, now_ms);

    // anything else the worker was asked to stop, it has stopped
    let stopped: Vec<RequestId> = state
        .reconciler
        .pending_cancellations(worker_id)
        .into_iter()
        .filter(|e| e.request_id != request_id)
        .map(|e| e.request_id.clone())
        .collect();
    let entries = stopped
        .iter()
        .filter_map(|rid| state.reconciler.confirm(worker_id, rid))
        .collect();
    settle(state, entries, decisions);

    let current = state
        .assignment(worker_id)
        .map(|a| (a.request.id == request_id, a.delivered));
    match current {
        Some((true, _)) => {
            if let Some(a) = state
                .workers
                .get_mut(worker_id)
                .and_then(|w| w.assignment.as_mut())
            {
                a.delivered = true;
            }
            return;
        }
        Some((false, true)) => {
            if let Some(done) = state.unbind(worker_id) {
                decisions.push(Decision::Completed {
                    worker_id: Some(worker_id.to_string()),
                    request_id: done.request.id,
                });
            }
        }
        Some((false, false)) => {
            if let Some(undelivered) = state.unbind(worker_id) {
                decisions.push(Decision::Requeued {
                    request_id: undelivered.request.id.clone(),
                });
                state.requeue(undelivered.request);
            }
        }
        None => {}
    }

    // only an entry for `request_id` itself can remain: the abort stands
    if state.reconciler.has_pending(worker_id) {
        return;
    }

    let adoptable = state.waiting.get(request_id).and_then(|request| {
        let labels = &state.workers.get(worker_id)?.labels;
        if !request.is_compatible(labels) {
            return None;
        }
        matcher::classify(state, request, &state.fanout_by_account())
    });
    if let Some(funding) = adoptable {
        if state.bind(worker_id, request_id, funding, now_ms, true) {
            tracing::info!(
                pool = %state.pool_id,
                worker = %worker_id,
                request = %request_id,
                "adopted request reported running"
            );
            decisions.push(Decision::Assigned {
                worker_id: worker_id.to_string(),
                request_id: request_id.to_string(),
                funding,
            });
            return;
        }
    }

    if state
        .reconciler
        .request_cancellation(request_id, worker_id, CancelAction::Abort, now_ms)
    {
        tracing::info!(
            pool = %state.pool_id,
            worker = %worker_id,
            request = %request_id,
            "worker runs an unexpected request, asking it to abort"
        );
        decisions.push(Decision::AbortRequested {
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
        });
    }
}

fn enqueue(
    state: &mut SchedulerState,
    requests: &[NewRequest],
    now_ms: u128,
    decisions: &mut Vec<Decision>,
) -> Result<(), SchedulerError> {
    let levels = state.settings.priority_levels;
    for request in requests {
        if request.id.is_empty() {
            return Err(SchedulerError::InvalidRequest("empty request id".into()));
        }
        if request.priority >= levels {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {} has priority {} but the pool has {levels} levels",
                request.id, request.priority
            )));
        }
        if let Some(account_id) = &request.account_id {
            if state.ledger.get(account_id).is_none() {
                return Err(SchedulerError::UnknownAccount(account_id.clone()));
            }
        }
    }
    for new in requests {
        if state.request_state(&new.id).is_some() {
            continue;
        }
        state.requeue(Request {
            id: new.id.clone(),
            priority: new.priority,
            account_id: new.account_id.clone(),
            labels: new.labels.clone(),
            enqueued_at_ms: new.enqueued_at_ms.unwrap_or(now_ms),
        });
        decisions.push(Decision::Enqueued {
            request_id: new.id.clone(),
        });
    }
    Ok(())
}

fn cancel(state: &mut SchedulerState, request_id: &str, now_ms: u128, decisions: &mut Vec<Decision>) {
    if state.waiting.remove(request_id).is_some() {
        decisions.push(Decision::Cancelled {
            request_id: request_id.to_string(),
        });
        return;
    }
    let Some(worker_id) = state.running.get(request_id).cloned() else {
        return;
    };
    if state
        .reconciler
        .request_cancellation(request_id, &worker_id, CancelAction::Abort, now_ms)
    {
        decisions.push(Decision::AbortRequested {
            worker_id,
            request_id: request_id.to_string(),
        });
    }
}

fn update_pool(state: &mut SchedulerState, settings: &PoolSettings) -> Result<(), SchedulerError> {
    settings.validate().map_err(SchedulerError::InvalidRequest)?;
    let levels = settings.priority_levels;
    for account in state.ledger.iter() {
        account.config.validate(levels)?;
    }
    let tracked = state
        .waiting
        .values()
        .chain(state.assignments().map(|(_, a)| &a.request))
        .find(|r| r.priority >= levels);
    if let Some(request) = tracked {
        return Err(SchedulerError::InvalidRequest(format!(
            "request {} at priority {} does not fit in {levels} levels",
            request.id, request.priority
        )));
    }
    state.ledger.resize_levels(levels);
    state.settings = settings.clone();
    Ok(())
}
