//! Quota-aware matching of waiting requests to idle workers, and the
//! preemption pass that frees workers for higher-ranked requests.
//!
//! Candidates are ranked by `(tier, enqueue time, request id)`. The tier folds
//! the funding level and the free/funded distinction together according to
//! the pool's [`FreeRanking`]; the trailing request id makes the order total,
//! so replaying a batch against the same snapshot yields the same bindings.
//!
//! Preemption never rebinds directly. It records a `Preempt` cancellation and
//! leaves the beneficiary waiting; the worker becomes matchable again only
//! after it reports that the victim stopped.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::FreeRanking;
use crate::core::decision::Decision;
use crate::core::reconciler::CancelAction;
use crate::core::state::{Request, SchedulerState};
use crate::util::serde::{AccountId, Funding, Priority, RequestId, WorkerId};

/// Ranking tier; smaller is better.
pub type Tier = (u8, Priority, u8);

/// Tier of a request with the given funding and nominal priority.
pub const fn tier(funding: Funding, nominal: Priority, ranking: FreeRanking) -> Tier {
    match (funding, ranking) {
        (Funding::Funded { level }, _) => (0, level, 0),
        (Funding::Free, FreeRanking::AfterFunded) => (1, nominal, 1),
        (Funding::Free, FreeRanking::WithinPriority) => (0, nominal, 1),
    }
}

/// Total order over candidates; smaller ranks first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RankKey {
    /// Funding tier.
    pub tier: Tier,
    /// FIFO tie-break.
    pub enqueued_at_ms: u128,
    /// Deterministic final tie-break.
    pub request_id: RequestId,
}

impl RankKey {
    /// Rank a request under a funding decision.
    pub fn new(request: &Request, funding: Funding, ranking: FreeRanking) -> Self {
        Self {
            tier: tier(funding, request.priority, ranking),
            enqueued_at_ms: request.enqueued_at_ms,
            request_id: request.id.clone(),
        }
    }
}

/// Decide how `request` would be paid for right now.
///
/// `in_use` holds the funded running count per account (plus any slots
/// reserved earlier in the same pass). Requests without an account, or whose
/// account has since been deleted, run free. A request whose account cannot
/// fund it falls back to free capacity unless the account disables free tasks,
/// in which case it is not eligible at all (`None`).
pub fn classify(
    state: &SchedulerState,
    request: &Request,
    in_use: &BTreeMap<AccountId, u32>,
) -> Option<Funding> {
    let Some(account_id) = request.account_id.as_deref() else {
        return Some(Funding::Free);
    };
    let Some(account) = state.ledger.get(account_id) else {
        return Some(Funding::Free);
    };
    let running = in_use.get(account_id).copied().unwrap_or(0);
    if let Some(level) = state.ledger.can_fund(account_id, request.priority, running) {
        return Some(Funding::Funded { level });
    }
    if account.config.disable_free_tasks {
        None
    } else {
        Some(Funding::Free)
    }
}

/// Start-of-batch bookkeeping: advance the ledger exactly once, forget stale
/// idle workers, and re-evaluate the funding of running requests.
pub fn prepare(state: &mut SchedulerState, now_ms: u128) -> Vec<Decision> {
    state.advance(now_ms);
    let pruned = state.prune_idle_workers(now_ms);
    if pruned > 0 {
        tracing::debug!(pool = %state.pool_id, pruned, "forgot stale idle workers");
    }
    reprioritize(state)
}

fn set_funding(state: &mut SchedulerState, worker_id: &str, to: Funding) -> Option<Decision> {
    let assignment = state.workers.get_mut(worker_id)?.assignment.as_mut()?;
    if assignment.funding == to {
        return None;
    }
    let from = assignment.funding;
    assignment.funding = to;
    Some(Decision::Reprioritized {
        worker_id: worker_id.to_string(),
        request_id: assignment.request.id.clone(),
        from,
        to,
    })
}

/// Re-evaluate funding of running requests after the ledger moved.
///
/// Funded runs move to the best level their account can still pay for (or to
/// free when it can pay for none), runs over a lowered fanout limit are made
/// free starting with the most recent, and free runs whose account can pay
/// again are promoted oldest first.
pub fn reprioritize(state: &mut SchedulerState) -> Vec<Decision> {
    let mut decisions = Vec::new();

    let funded: Vec<(WorkerId, Funding)> = state
        .assignments()
        .filter(|(_, a)| a.funding.is_funded())
        .map(|(worker_id, a)| {
            let next = a
                .request
                .account_id
                .as_deref()
                .and_then(|id| state.ledger.get(id))
                .and_then(|account| account.fundable_level(a.request.priority))
                .map_or(Funding::Free, |level| Funding::Funded { level });
            (worker_id.clone(), next)
        })
        .collect();
    for (worker_id, next) in funded {
        decisions.extend(set_funding(state, &worker_id, next));
    }

    for (account_id, count) in state.fanout_by_account() {
        let limit = state
            .ledger
            .get(&account_id)
            .map_or(0, |a| a.config.max_fanout);
        if limit == 0 || count <= limit {
            continue;
        }
        let mut runs: Vec<(u128, WorkerId)> = state
            .assignments()
            .filter(|(_, a)| {
                a.funding.is_funded() && a.request.account_id.as_deref() == Some(&account_id)
            })
            .map(|(worker_id, a)| (a.assigned_at_ms, worker_id.clone()))
            .collect();
        runs.sort();
        let excess = (count - limit) as usize;
        for (_, worker_id) in runs.iter().rev().take(excess) {
            decisions.extend(set_funding(state, worker_id, Funding::Free));
        }
    }

    let mut in_use = state.fanout_by_account();
    let mut free_runs: Vec<(u128, WorkerId)> = state
        .assignments()
        .filter(|(_, a)| !a.funding.is_funded() && a.request.account_id.is_some())
        .map(|(worker_id, a)| (a.assigned_at_ms, worker_id.clone()))
        .collect();
    free_runs.sort();
    for (_, worker_id) in free_runs {
        let Some(assignment) = state.assignment(&worker_id) else {
            continue;
        };
        let Some(account_id) = assignment.request.account_id.clone() else {
            continue;
        };
        let running = in_use.get(&account_id).copied().unwrap_or(0);
        let Some(level) = state
            .ledger
            .can_fund(&account_id, assignment.request.priority, running)
        else {
            continue;
        };
        decisions.extend(set_funding(state, &worker_id, Funding::Funded { level }));
        *in_use.entry(account_id).or_insert(0) += 1;
    }

    decisions
}

/// Bind each idle worker, in id order, to the best compatible and eligible
/// waiting request.
pub fn assign(state: &mut SchedulerState, now_ms: u128) -> Vec<Decision> {
    let ranking = state.settings.free_ranking;
    let idle: Vec<WorkerId> = state.idle_workers().map(|w| w.id.clone()).collect();
    let mut in_use = state.fanout_by_account();
    let mut decisions = Vec::new();

    for worker_id in idle {
        let Some(worker) = state.workers.get(&worker_id) else {
            continue;
        };
        let best = state
            .waiting
            .values()
            .filter(|r| r.is_compatible(&worker.labels))
            .filter_map(|r| {
                classify(state, r, &in_use)
                    .map(|f| (RankKey::new(r, f, ranking), f, r.account_id.clone()))
            })
            .min_by(|a, b| a.0.cmp(&b.0));
        let Some((key, funding, account_id)) = best else {
            continue;
        };
        if !state.bind(&worker_id, &key.request_id, funding, now_ms, false) {
            continue;
        }
        if let (true, Some(account_id)) = (funding.is_funded(), account_id) {
            *in_use.entry(account_id).or_insert(0) += 1;
        }
        tracing::debug!(
            pool = %state.pool_id,
            worker = %worker_id,
            request = %key.request_id,
            ?funding,
            "bound request"
        );
        decisions.push(Decision::Assigned {
            worker_id,
            request_id: key.request_id,
            funding,
        });
    }
    decisions
}

/// For each funded waiting request that found no idle worker, ask one
/// compatible worker running a strictly lower-tier request to stop.
///
/// Free requests never preempt. A request already benefiting from a pending
/// preemption is skipped, as is any worker with a pending cancellation. The
/// victim is the worst-tier run, then the most recently started one.
pub fn preempt(state: &mut SchedulerState, now_ms: u128) -> Vec<Decision> {
    if !state.settings.enable_preemption {
        return Vec::new();
    }
    let ranking = state.settings.free_ranking;
    let mut in_use = state.fanout_by_account();
    let mut candidates: Vec<RankKey> = state
        .waiting
        .values()
        .filter(|r| !state.reconciler.is_beneficiary(&r.id))
        .filter_map(|r| match classify(state, r, &in_use) {
            Some(f @ Funding::Funded { .. }) => Some(RankKey::new(r, f, ranking)),
            _ => None,
        })
        .collect();
    candidates.sort();

    let mut claimed: BTreeSet<WorkerId> = BTreeSet::new();
    let mut decisions = Vec::new();
    for key in candidates {
        let Some(request) = state.waiting.get(&key.request_id) else {
            continue;
        };
        let Some(funding @ Funding::Funded { .. }) = classify(state, request, &in_use) else {
            continue;
        };
        let wanted = tier(funding, request.priority, ranking);
        let victim = state
            .workers
            .values()
            .filter(|w| !claimed.contains(&w.id) && !state.reconciler.has_pending(&w.id))
            .filter(|w| request.is_compatible(&w.labels))
            .filter_map(|w| {
                w.assignment
                    .as_ref()
                    .map(|a| (w, a, tier(a.funding, a.request.priority, ranking)))
            })
            .filter(|(_, _, t)| *t > wanted)
            .max_by(|(wa, a, ta), (wb, b, tb)| {
                ta.cmp(tb)
                    .then(a.assigned_at_ms.cmp(&b.assigned_at_ms))
                    .then(wa.id.cmp(&wb.id))
            })
            .map(|(w, a, _)| (w.id.clone(), a.request.id.clone()));
        let Some((worker_id, victim_id)) = victim else {
            continue;
        };
        let account_id = request.account_id.clone();
        let for_request = request.id.clone();

        state.reconciler.request_cancellation(
            &victim_id,
            &worker_id,
            CancelAction::Preempt {
                for_request: for_request.clone(),
            },
            now_ms,
        );
        if let Some(account_id) = account_id {
            *in_use.entry(account_id).or_insert(0) += 1;
        }
        tracing::info!(
            pool = %state.pool_id,
            worker = %worker_id,
            victim = %victim_id,
            beneficiary = %for_request,
            "requested preemption"
        );
        claimed.insert(worker_id.clone());
        decisions.push(Decision::PreemptRequested {
            worker_id,
            request_id: victim_id,
            for_request,
        });
    }
    decisions
}

/// Matching for one batch: bind idle workers, then preempt for whatever
/// funded requests are still waiting.
pub fn run(state: &mut SchedulerState, now_ms: u128) -> Vec<Decision> {
    let mut decisions = assign(state, now_ms);
    decisions.extend(preempt(state, now_ms));
    decisions
}
