//! Core scheduling state machine, matching algorithm and batch runner.

pub mod audit;
pub mod batch;
pub mod decision;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod node_store;
pub mod reconciler;
pub mod scheduler;
pub mod state;
pub mod transition;

pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink};
pub use batch::{spawn_pool_actor, PoolActor, PoolHandle, SharedAudit, Spawn};
pub use decision::Decision;
pub use error::{AppResult, SchedulerError};
pub use ledger::{Account, AccountConfig, Ledger};
pub use node_store::{NodeStore, Versioned};
pub use reconciler::{CancelAction, ReconcileEntry, ReconcileState, Reconciler};
pub use scheduler::{AccountSummary, Inspection, Scheduler};
pub use state::{Assignment, Request, RequestState, SchedulerState, Worker, WorkerStatus};
pub use transition::{
    apply_batch, AssignmentView, BatchReport, IdleWorker, NewRequest, OpOutcome, Operation,
    WorkerEvent,
};
