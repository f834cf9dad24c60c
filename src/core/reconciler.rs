//! Cancellation handshake between the scheduler and its workers.
//!
//! When the scheduler decides that a running request must stop, it records a
//! [`ReconcileEntry`] instead of rebinding the worker right away. The worker
//! learns about the entry through the cancellation query and the entry is
//! resolved only once the worker's own report shows it no longer runs the
//! request. While any entry exists for a worker, that worker is never handed a
//! new request.
//!
//! ```text
//! Running --request_cancellation--> CancelRequested --confirm--> Confirmed
//!                                                   \-supersede-> TimedOut
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::serde::{RequestId, WorkerId};

/// What the worker is asked to do with the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CancelAction {
    /// Stop to make room for `for_request`; the stopped request returns to the
    /// waiting set.
    Preempt {
        /// Higher-ranked waiting request the worker is being freed for.
        for_request: RequestId,
    },
    /// Stop for good; the request is dropped once the stop is confirmed.
    Abort,
}

impl CancelAction {
    /// Beneficiary of a preemption.
    pub fn beneficiary(&self) -> Option<&RequestId> {
        match self {
            Self::Preempt { for_request } => Some(for_request),
            Self::Abort => None,
        }
    }
}

/// Lifecycle of a pending cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    /// Decided by the scheduler, not yet acknowledged by the worker.
    CancelRequested,
    /// The worker reported it stopped the request.
    Confirmed,
    /// The worker re-registered without accounting for the request; it is
    /// presumed finished or lost out-of-band.
    TimedOut,
}

/// A pending (or just resolved) cancellation of `request_id` on `worker_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileEntry {
    /// Request to stop.
    pub request_id: RequestId,
    /// Worker expected to stop it.
    pub worker_id: WorkerId,
    /// Requested action.
    pub action: CancelAction,
    /// Current state; stored entries are always `CancelRequested`.
    pub state: ReconcileState,
    /// When the cancellation was decided (ms since epoch).
    pub requested_at_ms: u128,
}

/// Pending cancellations of one pool, keyed by worker then request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciler {
    entries: BTreeMap<WorkerId, BTreeMap<RequestId, ReconcileEntry>>,
}

impl Reconciler {
    /// Record that `request_id` must stop on `worker_id`.
    ///
    /// An existing entry for the same pair is kept, except that an `Abort`
    /// overrides a `Preempt`: a request cancelled by its producer must not be
    /// requeued. Returns whether the stored entry changed.
    pub fn request_cancellation(
        &mut self,
        request_id: &str,
        worker_id: &str,
        action: CancelAction,
        now_ms: u128,
    ) -> bool {
        let per_worker = self.entries.entry(worker_id.to_string()).or_default();
        if let Some(existing) = per_worker.get_mut(request_id) {
            if action == CancelAction::Abort && existing.action != CancelAction::Abort {
                existing.action = CancelAction::Abort;
                return true;
            }
            return false;
        }
        per_worker.insert(
            request_id.to_string(),
            ReconcileEntry {
                request_id: request_id.to_string(),
                worker_id: worker_id.to_string(),
                action,
                state: ReconcileState::CancelRequested,
                requested_at_ms: now_ms,
            },
        );
        true
    }

    /// The worker confirmed it no longer runs `request_id`. Removes and returns
    /// the entry in state `Confirmed`.
    pub fn confirm(&mut self, worker_id: &str, request_id: &str) -> Option<ReconcileEntry> {
        let per_worker = self.entries.get_mut(worker_id)?;
        let mut entry = per_worker.remove(request_id)?;
        if per_worker.is_empty() {
            self.entries.remove(worker_id);
        }
        entry.state = ReconcileState::Confirmed;
        Some(entry)
    }

    /// Resolve every entry of a worker whose report supersedes them (it reports
    /// idle, or running something else). Entries come back `Confirmed` when the
    /// report came through an explicit notification and `TimedOut` when the
    /// worker merely re-registered.
    pub fn resolve_worker(&mut self, worker_id: &str, confirmed: bool) -> Vec<ReconcileEntry> {
        let state = if confirmed {
            ReconcileState::Confirmed
        } else {
            ReconcileState::TimedOut
        };
        self.entries
            .remove(worker_id)
            .map(|m| {
                m.into_values()
                    .map(|mut e| {
                        e.state = state;
                        e
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries the worker has yet to act on.
    pub fn pending_cancellations(&self, worker_id: &str) -> Vec<&ReconcileEntry> {
        self.entries
            .get(worker_id)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Whether the worker has any unresolved cancellation.
    pub fn has_pending(&self, worker_id: &str) -> bool {
        self.entries.contains_key(worker_id)
    }

    /// Whether `request_id` already benefits from a pending preemption.
    pub fn is_beneficiary(&self, request_id: &str) -> bool {
        self.iter()
            .any(|e| e.action.beneficiary().is_some_and(|r| r == request_id))
    }

    /// All entries in worker, then request order.
    pub fn iter(&self) -> impl Iterator<Item = &ReconcileEntry> {
        self.entries.values().flat_map(BTreeMap::values)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
