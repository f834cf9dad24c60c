//! Scheduling decisions produced by one batch transition, used for logging and
//! the audit trail once the batch commits.

use serde::{Deserialize, Serialize};

use crate::core::reconciler::ReconcileState;
use crate::util::serde::{AccountId, Funding, RequestId, WorkerId};

/// One observable change made by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// A request entered the waiting set.
    Enqueued {
        /// Request.
        request_id: RequestId,
    },
    /// A waiting request was bound to a worker.
    Assigned {
        /// Worker.
        worker_id: WorkerId,
        /// Request.
        request_id: RequestId,
        /// Funding chosen for the run.
        funding: Funding,
    },
    /// A running request was asked to stop for a higher-ranked one.
    PreemptRequested {
        /// Worker running the victim.
        worker_id: WorkerId,
        /// Victim request.
        request_id: RequestId,
        /// Waiting request the worker is freed for.
        for_request: RequestId,
    },
    /// A worker was asked to drop a request for good.
    AbortRequested {
        /// Worker.
        worker_id: WorkerId,
        /// Request.
        request_id: RequestId,
    },
    /// A pending cancellation was resolved by a worker report.
    Resolved {
        /// Worker.
        worker_id: WorkerId,
        /// Request.
        request_id: RequestId,
        /// `Confirmed` or `TimedOut`.
        state: ReconcileState,
    },
    /// A stopped or never-started request went back to the waiting set.
    Requeued {
        /// Request.
        request_id: RequestId,
    },
    /// A request finished and left the pool.
    Completed {
        /// Worker that ran it, when known.
        worker_id: Option<WorkerId>,
        /// Request.
        request_id: RequestId,
    },
    /// A request was cancelled and left the pool.
    Cancelled {
        /// Request.
        request_id: RequestId,
    },
    /// A running request changed funding.
    Reprioritized {
        /// Worker.
        worker_id: WorkerId,
        /// Request.
        request_id: RequestId,
        /// Previous funding.
        from: Funding,
        /// New funding.
        to: Funding,
    },
    /// An account was created or reconfigured.
    AccountUpdated {
        /// Account.
        account_id: AccountId,
    },
    /// An account was deleted.
    AccountDeleted {
        /// Account.
        account_id: AccountId,
    },
    /// Pool settings changed.
    PoolUpdated,
    /// Pool state was wiped.
    Wiped,
}

impl Decision {
    /// Short action name for audit records.
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueue",
            Self::Assigned { .. } => "assign",
            Self::PreemptRequested { .. } => "preempt",
            Self::AbortRequested { .. } => "abort",
            Self::Resolved { .. } => "resolve",
            Self::Requeued { .. } => "requeue",
            Self::Completed { .. } => "complete",
            Self::Cancelled { .. } => "cancel",
            Self::Reprioritized { .. } => "reprioritize",
            Self::AccountUpdated { .. } => "account_update",
            Self::AccountDeleted { .. } => "account_delete",
            Self::PoolUpdated => "pool_update",
            Self::Wiped => "wipe",
        }
    }

    /// Request (or account) the decision is about.
    pub fn subject(&self) -> &str {
        match self {
            Self::Enqueued { request_id }
            | Self::Assigned { request_id, .. }
            | Self::PreemptRequested { request_id, .. }
            | Self::AbortRequested { request_id, .. }
            | Self::Resolved { request_id, .. }
            | Self::Requeued { request_id }
            | Self::Completed { request_id, .. }
            | Self::Cancelled { request_id }
            | Self::Reprioritized { request_id, .. } => request_id,
            Self::AccountUpdated { account_id } | Self::AccountDeleted { account_id } => {
                account_id
            }
            Self::PoolUpdated | Self::Wiped => "pool",
        }
    }

    /// Worker involved, if any.
    pub fn worker(&self) -> Option<&str> {
        match self {
            Self::Assigned { worker_id, .. }
            | Self::PreemptRequested { worker_id, .. }
            | Self::AbortRequested { worker_id, .. }
            | Self::Resolved { worker_id, .. }
            | Self::Reprioritized { worker_id, .. } => Some(worker_id),
            Self::Completed { worker_id, .. } => worker_id.as_deref(),
            _ => None,
        }
    }
}
