//! In-memory snapshot of one pool.
//!
//! `SchedulerState` is the unit of persistence: it is loaded from the node
//! store, mutated by exactly one batch transition, and written back as a single
//! versioned blob. Every collection is ordered so that the same operations on
//! the same snapshot always produce the same result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PoolSettings;
use crate::core::ledger::Ledger;
use crate::core::reconciler::Reconciler;
use crate::core::SchedulerError;
use crate::util::serde::{AccountId, Funding, LabelSet, PoolId, Priority, RequestId, WorkerId};

/// A task request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Request identifier.
    pub id: RequestId,
    /// Requested priority level.
    pub priority: Priority,
    /// Owning account; `None` marks a free request.
    pub account_id: Option<AccountId>,
    /// Labels a worker must carry to run this request.
    pub labels: LabelSet,
    /// Enqueue time (ms since epoch), the FIFO tie-break.
    pub enqueued_at_ms: u128,
}

impl Request {
    /// Whether a worker with `worker_labels` can run this request.
    pub fn is_compatible(&self, worker_labels: &LabelSet) -> bool {
        self.labels.is_subset(worker_labels)
    }
}

/// Binding of a running request to its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// The running request.
    pub request: Request,
    /// How the run is currently paid for.
    pub funding: Funding,
    /// When the binding was made (ms since epoch).
    pub assigned_at_ms: u128,
    /// Whether the worker has been told about (or reported) this binding.
    pub delivered: bool,
}

/// Worker status derived from its assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Nothing bound.
    Idle,
    /// Bound to exactly one request.
    Running,
}

/// A worker as last reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker identifier.
    pub id: WorkerId,
    /// Advertised labels.
    pub labels: LabelSet,
    /// Last report time (ms since epoch).
    pub last_seen_ms: u128,
    /// Current binding, if any.
    pub assignment: Option<Assignment>,
}

impl Worker {
    /// Idle or running.
    pub const fn status(&self) -> WorkerStatus {
        if self.assignment.is_some() {
            WorkerStatus::Running
        } else {
            WorkerStatus::Idle
        }
    }
}

/// Where a request currently is. Terminal (cancelled or completed) requests
/// are no longer tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// In the waiting set.
    Waiting,
    /// Bound to the given worker.
    Running(WorkerId),
}

/// Full state of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Owning pool.
    pub pool_id: PoolId,
    /// Pool policy.
    pub settings: PoolSettings,
    /// Accounts and balances.
    pub ledger: Ledger,
    /// Known workers.
    pub workers: BTreeMap<WorkerId, Worker>,
    /// Requests not yet bound.
    pub waiting: BTreeMap<RequestId, Request>,
    /// Index of running requests to their worker.
    pub running: BTreeMap<RequestId, WorkerId>,
    /// Pending cancellations.
    pub reconciler: Reconciler,
    /// Time the ledger was last advanced to.
    pub last_advanced_ms: Option<u128>,
}

impl SchedulerState {
    /// Empty state for a new pool.
    pub fn new(pool_id: impl Into<PoolId>, settings: PoolSettings) -> Self {
        Self {
            pool_id: pool_id.into(),
            settings,
            ledger: Ledger::default(),
            workers: BTreeMap::new(),
            waiting: BTreeMap::new(),
            running: BTreeMap::new(),
            reconciler: Reconciler::default(),
            last_advanced_ms: None,
        }
    }

    /// Decode a persisted blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self, SchedulerError> {
        Ok(serde_json::from_slice(blob)?)
    }

    /// Encode for persistence.
    pub fn to_blob(&self) -> Result<Vec<u8>, SchedulerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Where `request_id` is, if tracked.
    pub fn request_state(&self, request_id: &str) -> Option<RequestState> {
        if self.waiting.contains_key(request_id) {
            return Some(RequestState::Waiting);
        }
        self.running
            .get(request_id)
            .map(|w| RequestState::Running(w.clone()))
    }

    /// Assignment of a worker.
    pub fn assignment(&self, worker_id: &str) -> Option<&Assignment> {
        self.workers.get(worker_id)?.assignment.as_ref()
    }

    /// All assignments in worker order.
    pub fn assignments(&self) -> impl Iterator<Item = (&WorkerId, &Assignment)> {
        self.workers
            .iter()
            .filter_map(|(id, w)| w.assignment.as_ref().map(|a| (id, a)))
    }

    /// Number of running requests funded by `account_id`.
    pub fn fanout(&self, account_id: &str) -> u32 {
        let count = self
            .assignments()
            .filter(|(_, a)| {
                a.funding.is_funded() && a.request.account_id.as_deref() == Some(account_id)
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Funded running counts for every account that funds anything.
    pub fn fanout_by_account(&self) -> BTreeMap<AccountId, u32> {
        let mut out = BTreeMap::new();
        for (_, a) in self.assignments() {
            if let (true, Some(account)) = (a.funding.is_funded(), &a.request.account_id) {
                *out.entry(account.clone()).or_insert(0) += 1;
            }
        }
        out
    }

    /// Funded running counts per account and level, for ledger debits.
    pub fn running_by_level(&self) -> BTreeMap<AccountId, Vec<u32>> {
        let levels = self.settings.priority_levels;
        let mut out: BTreeMap<AccountId, Vec<u32>> = BTreeMap::new();
        for (_, a) in self.assignments() {
            if let (Some(level), Some(account)) = (a.funding.level(), &a.request.account_id) {
                let counts = out
                    .entry(account.clone())
                    .or_insert_with(|| vec![0; levels]);
                if let Some(slot) = counts.get_mut(level) {
                    *slot += 1;
                }
            }
        }
        out
    }

    /// Advance quota accounting to `now_ms`. The first call only records the
    /// time; a clock that moved backwards accrues nothing.
    pub fn advance(&mut self, now_ms: u128) {
        let Some(last) = self.last_advanced_ms else {
            self.last_advanced_ms = Some(now_ms);
            return;
        };
        if now_ms <= last {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let elapsed_secs = (now_ms - last) as f64 / 1000.0;
        let running = self.running_by_level();
        self.ledger.advance(elapsed_secs, &running);
        self.last_advanced_ms = Some(now_ms);
    }

    /// Record a worker report, creating the worker on first sight.
    pub fn touch_worker(&mut self, worker_id: &str, labels: Option<LabelSet>, now_ms: u128) {
        let worker = self
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| Worker {
                id: worker_id.to_string(),
                labels: LabelSet::new(),
                last_seen_ms: now_ms,
                assignment: None,
            });
        if let Some(labels) = labels {
            worker.labels = labels;
        }
        worker.last_seen_ms = worker.last_seen_ms.max(now_ms);
    }

    /// Workers that may receive a new request: known, unbound, and without any
    /// pending cancellation.
    pub fn idle_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers
            .values()
            .filter(|w| w.assignment.is_none() && !self.reconciler.has_pending(&w.id))
    }

    /// Bind a waiting request to an unbound worker. Returns `false` (and
    /// changes nothing) when either side is not in the expected state.
    pub fn bind(
        &mut self,
        worker_id: &str,
        request_id: &str,
        funding: Funding,
        now_ms: u128,
        delivered: bool,
    ) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.assignment.is_some() {
            return false;
        }
        let Some(request) = self.waiting.remove(request_id) else {
            return false;
        };
        worker.assignment = Some(Assignment {
            request,
            funding,
            assigned_at_ms: now_ms,
            delivered,
        });
        self.running
            .insert(request_id.to_string(), worker_id.to_string());
        true
    }

    /// Remove a worker's binding, returning it.
    pub fn unbind(&mut self, worker_id: &str) -> Option<Assignment> {
        let assignment = self.workers.get_mut(worker_id)?.assignment.take()?;
        self.running.remove(&assignment.request.id);
        Some(assignment)
    }

    /// Put a request back into the waiting set with its original enqueue time.
    pub fn requeue(&mut self, request: Request) {
        self.waiting.insert(request.id.clone(), request);
    }

    /// Forget idle workers that have not reported within the pool's TTL.
    /// Returns the number removed.
    pub fn prune_idle_workers(&mut self, now_ms: u128) -> usize {
        let Some(ttl) = self.settings.idle_worker_ttl_ms else {
            return 0;
        };
        let ttl = u128::from(ttl);
        let stale: Vec<WorkerId> = self
            .idle_workers()
            .filter(|w| now_ms.saturating_sub(w.last_seen_ms) > ttl)
            .map(|w| w.id.clone())
            .collect();
        for id in &stale {
            self.workers.remove(id);
        }
        stale.len()
    }

    /// Drop workers, requests, assignments, cancellations and balances. Pool
    /// settings and account configuration survive.
    pub fn wipe(&mut self) {
        self.workers.clear();
        self.waiting.clear();
        self.running.clear();
        self.reconciler.clear();
        self.ledger.reset_balances();
    }

    /// Mark the binding of `worker_id` to `request_id` as not yet seen by the
    /// worker, so its next poll hands it out again. Returns whether anything
    /// changed.
    pub fn undeliver(&mut self, worker_id: &str, request_id: &str) -> bool {
        let assignment = self
            .workers
            .get_mut(worker_id)
            .and_then(|w| w.assignment.as_mut());
        match assignment {
            Some(a) if a.request.id == request_id && a.delivered => {
                a.delivered = false;
                true
            }
            _ => false,
        }
    }

    /// Check the structural invariants of the pool.
    pub fn check_invariants(&self) -> Result<(), String> {
        // every running request is bound to the worker the index names
        let mut bound = 0usize;
        for (worker_id, assignment) in self.assignments() {
            bound += 1;
            let rid = &assignment.request.id;
            match self.running.get(rid) {
                Some(w) if w == worker_id => {}
                other => {
                    return Err(format!(
                        "request {rid} bound to {worker_id} but indexed as {other:?}"
                    ))
                }
            }
            if self.waiting.contains_key(rid) {
                return Err(format!("request {rid} is both waiting and running"));
            }
            let labels = &self.workers[worker_id].labels;
            if !assignment.request.is_compatible(labels) {
                return Err(format!(
                    "request {rid} on {worker_id} requires labels the worker lacks"
                ));
            }
            if let Some(level) = assignment.funding.level() {
                if assignment.request.account_id.is_none() {
                    return Err(format!("request {rid} funded without an account"));
                }
                if level >= self.settings.priority_levels {
                    return Err(format!("request {rid} funded at out-of-range level {level}"));
                }
            }
        }
        if bound != self.running.len() {
            return Err(format!(
                "{} running index entries for {bound} assignments",
                self.running.len()
            ));
        }
        for account in self.ledger.iter() {
            let running = self.fanout(&account.id);
            if account.config.max_fanout != 0 && running > account.config.max_fanout {
                return Err(format!(
                    "account {} funds {running} tasks over fanout {}",
                    account.id, account.config.max_fanout
                ));
            }
            for (level, value) in account.balance.iter().enumerate() {
                let cap = account.config.cap(level);
                if *value < 0.0 || *value > cap {
                    return Err(format!(
                        "account {} balance {value} at level {level} outside [0, {cap}]",
                        account.id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::AccountConfig;
    use crate::util::serde::labels;

    fn request(id: &str, account: Option<&str>) -> Request {
        Request {
            id: id.into(),
            priority: 0,
            account_id: account.map(Into::into),
            labels: labels(["pool:a"]),
            enqueued_at_ms: 0,
        }
    }

    fn state_with_worker() -> SchedulerState {
        let mut state = SchedulerState::new("p", PoolSettings::default());
        state.touch_worker("w1", Some(labels(["pool:a", "os:linux"])), 100);
        state
    }

    #[test]
    fn test_bind_and_unbind_keep_index_consistent() {
        let mut state = state_with_worker();
        state.requeue(request("r1", None));
        assert_eq!(state.request_state("r1"), Some(RequestState::Waiting));

        assert!(state.bind("w1", "r1", Funding::Free, 200, false));
        assert_eq!(
            state.request_state("r1"),
            Some(RequestState::Running("w1".into()))
        );
        assert_eq!(state.workers["w1"].status(), WorkerStatus::Running);
        assert!(state.check_invariants().is_ok());

        // worker already busy
        state.requeue(request("r2", None));
        assert!(!state.bind("w1", "r2", Funding::Free, 200, false));

        let a = state.unbind("w1").unwrap();
        assert_eq!(a.request.id, "r1");
        assert_eq!(state.request_state("r1"), None);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_pending_cancellation_hides_idle_worker() {
        let mut state = state_with_worker();
        assert_eq!(state.idle_workers().count(), 1);
        state.reconciler.request_cancellation(
            "ghost",
            "w1",
            crate::core::reconciler::CancelAction::Abort,
            0,
        );
        assert_eq!(state.idle_workers().count(), 0);
    }

    #[test]
    fn test_fanout_counts_only_funded_runs() {
        let mut state = state_with_worker();
        state.touch_worker("w2", Some(labels(["pool:a"])), 100);
        state.ledger.upsert("acct", AccountConfig::default(), 3);
        state.requeue(request("r1", Some("acct")));
        state.requeue(request("r2", Some("acct")));
        state.bind("w1", "r1", Funding::Funded { level: 0 }, 1, true);
        state.bind("w2", "r2", Funding::Free, 1, true);
        assert_eq!(state.fanout("acct"), 1);
        assert_eq!(state.fanout_by_account().get("acct"), Some(&1));
        assert_eq!(state.running_by_level()["acct"], vec![1, 0, 0]);
    }

    #[test]
    fn test_first_advance_only_records_time() {
        let mut state = state_with_worker();
        state.ledger.upsert(
            "acct",
            AccountConfig {
                charge_rates: vec![1.0],
                max_charge_seconds: 100.0,
                ..AccountConfig::default()
            },
            3,
        );
        state.advance(10_000);
        assert_eq!(state.ledger.get("acct").unwrap().balance_at(0), 0.0);
        state.advance(13_000);
        assert_eq!(state.ledger.get("acct").unwrap().balance_at(0), 3.0);
        // clock regression accrues nothing
        state.advance(12_000);
        assert_eq!(state.ledger.get("acct").unwrap().balance_at(0), 3.0);
        assert_eq!(state.last_advanced_ms, Some(13_000));
    }

    #[test]
    fn test_prune_idle_workers_respects_ttl() {
        let mut state = state_with_worker();
        state.settings.idle_worker_ttl_ms = Some(1_000);
        state.touch_worker("w2", None, 5_000);
        assert_eq!(state.prune_idle_workers(5_500), 1);
        assert!(state.workers.contains_key("w2"));
        assert!(!state.workers.contains_key("w1"));
    }

    #[test]
    fn test_blob_round_trip_preserves_state() {
        let mut state = state_with_worker();
        state.requeue(request("r1", None));
        state.bind("w1", "r1", Funding::Free, 5, true);
        let decoded = SchedulerState::from_blob(&state.to_blob().unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_blob_round_trip_keeps_capped_balances_exact() {
        for i in 1..400u32 {
            let mut state = SchedulerState::new("p", PoolSettings::default());
            let rate = f64::from(i) / 7.0 + 0.1;
            state.ledger.upsert(
                "a",
                AccountConfig {
                    charge_rates: vec![rate, rate / 3.0, rate / 11.0],
                    max_charge_seconds: 1.0 + f64::from(i) / 13.0,
                    ..AccountConfig::default()
                },
                state.settings.priority_levels,
            );
            state.advance(0);
            state.advance(86_400_000);
            assert!(state.check_invariants().is_ok());

            let decoded = SchedulerState::from_blob(&state.to_blob().unwrap()).unwrap();
            assert_eq!(decoded, state, "rate {rate}");
            assert!(decoded.check_invariants().is_ok(), "rate {rate}");
        }
    }

    #[test]
    fn test_undeliver_only_touches_the_named_binding() {
        let mut state = state_with_worker();
        state.requeue(request("r1", None));
        state.bind("w1", "r1", Funding::Free, 5, true);
        assert!(!state.undeliver("w1", "r2"));
        assert!(!state.undeliver("w9", "r1"));
        assert!(state.undeliver("w1", "r1"));
        assert!(!state.assignment("w1").unwrap().delivered);
        assert!(!state.undeliver("w1", "r1"));
    }

    #[test]
    fn test_invariant_check_catches_label_mismatch() {
        let mut state = state_with_worker();
        let mut r = request("r1", None);
        r.labels = labels(["gpu"]);
        state.requeue(r);
        state.bind("w1", "r1", Funding::Free, 5, true);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_wipe_keeps_accounts_and_settings() {
        let mut state = state_with_worker();
        state.settings.enable_preemption = false;
        state.ledger.upsert(
            "acct",
            AccountConfig {
                charge_rates: vec![1.0],
                max_charge_seconds: 10.0,
                ..AccountConfig::default()
            },
            3,
        );
        state.advance(0);
        state.advance(5_000);
        state.requeue(request("r1", None));
        state.wipe();
        assert!(state.workers.is_empty());
        assert!(state.waiting.is_empty());
        assert!(!state.settings.enable_preemption);
        assert_eq!(state.ledger.get("acct").unwrap().balance_at(0), 0.0);
    }
}
