//! API-facing request/response models.
//!
//! Transport is left to the embedder; these are the serde shapes of every
//! external operation plus thin functions mapping them onto [`Scheduler`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PoolSettings;
use crate::core::{
    AccountConfig, AccountSummary, AssignmentView, IdleWorker, Inspection, NewRequest, OpOutcome,
    Operation, Scheduler, SchedulerError, Spawn, WorkerEvent,
};
use crate::util::serde::{AccountId, PoolId, RequestId, WorkerId};

/// Workers polling for work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTasksRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Idle workers.
    pub workers: Vec<IdleWorker>,
    /// Optional caller deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Bindings for the polling workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTasksResponse {
    /// New or not yet delivered assignments.
    pub assignments: Vec<AssignmentView>,
}

/// Worker state reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyTasksRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Reports.
    pub events: Vec<WorkerEvent>,
    /// Optional caller deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Request submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequestsRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Requests.
    pub requests: Vec<NewRequest>,
    /// Optional caller deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Request withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequestsRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Requests to cancel.
    pub request_ids: Vec<RequestId>,
    /// Optional caller deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Cancellation query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCancellationsRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Polling worker.
    pub worker_id: WorkerId,
}

/// A list of request ids (cancellations or callbacks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdsResponse {
    /// Request ids.
    pub request_ids: Vec<RequestId>,
}

/// Pool creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePoolRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Settings; the configured default when absent.
    #[serde(default)]
    pub settings: Option<PoolSettings>,
}

/// Pool settings change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePoolRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// New settings.
    pub settings: PoolSettings,
}

/// Any call addressing a whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRef {
    /// Pool identifier.
    pub pool_id: PoolId,
}

/// Account creation or change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertAccountRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Account identifier.
    pub account_id: AccountId,
    /// Configuration.
    pub config: AccountConfig,
}

/// Account deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteAccountRequest {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Account identifier.
    pub account_id: AccountId,
}

/// Account listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAccountsResponse {
    /// Accounts in id order.
    pub accounts: Vec<AccountSummary>,
}

/// Pool listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPoolsResponse {
    /// Pool ids in order.
    pub pools: Vec<PoolId>,
}

/// Acknowledgement of a mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always `true`; failures come back as [`ErrorBody`].
    pub ok: bool,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Client error: do not retry without changing the request.
    pub client_error: bool,
    /// Safe to resubmit unchanged.
    pub retryable: bool,
}

impl From<SchedulerError> for ErrorBody {
    fn from(err: SchedulerError) -> Self {
        let code = match &err {
            SchedulerError::UnknownPool(_) => "unknown_pool",
            SchedulerError::PoolExists(_) => "pool_exists",
            SchedulerError::UnknownAccount(_) => "unknown_account",
            SchedulerError::InvalidRequest(_) => "invalid_request",
            SchedulerError::Conflict { .. } => "conflict",
            SchedulerError::Unavailable(_) => "unavailable",
            SchedulerError::DeadlineExceeded => "deadline_exceeded",
            SchedulerError::Backend(_) => "backend",
            SchedulerError::Codec(_) => "codec",
        };
        Self {
            code: code.to_string(),
            message: err.to_string(),
            client_error: err.is_client_error(),
            retryable: err.is_retryable(),
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
}

const ACK: Ack = Ack { ok: true };

async fn submit<S: Spawn>(
    scheduler: &Scheduler<S>,
    pool: &str,
    op: Operation,
    timeout_ms: Option<u64>,
) -> Result<OpOutcome, ErrorBody> {
    scheduler
        .submit(pool, op, timeout_ms.map(Duration::from_millis))
        .await
        .map_err(ErrorBody::from)
}

/// Serve `AssignTasks`.
pub async fn assign_tasks<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: AssignTasksRequest,
) -> Result<AssignTasksResponse, ErrorBody> {
    let op = Operation::AssignTasks {
        workers: req.workers,
    };
    let assignments = match submit(scheduler, &req.pool_id, op, req.timeout_ms).await? {
        OpOutcome::Assignments(views) => views,
        OpOutcome::Applied => Vec::new(),
    };
    Ok(AssignTasksResponse { assignments })
}

/// Serve `NotifyTasks`.
pub async fn notify_tasks<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: NotifyTasksRequest,
) -> Result<Ack, ErrorBody> {
    let op = Operation::NotifyTasks { events: req.events };
    submit(scheduler, &req.pool_id, op, req.timeout_ms).await?;
    Ok(ACK)
}

/// Serve request submission.
pub async fn enqueue_requests<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: EnqueueRequestsRequest,
) -> Result<Ack, ErrorBody> {
    let op = Operation::EnqueueRequests {
        requests: req.requests,
    };
    submit(scheduler, &req.pool_id, op, req.timeout_ms).await?;
    Ok(ACK)
}

/// Serve request withdrawal.
pub async fn cancel_requests<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: CancelRequestsRequest,
) -> Result<Ack, ErrorBody> {
    let op = Operation::CancelRequests {
        request_ids: req.request_ids,
    };
    submit(scheduler, &req.pool_id, op, req.timeout_ms).await?;
    Ok(ACK)
}

/// Serve `GetCancellations`.
pub async fn get_cancellations<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: GetCancellationsRequest,
) -> Result<RequestIdsResponse, ErrorBody> {
    let request_ids = scheduler
        .get_cancellations(&req.pool_id, &req.worker_id)
        .await?;
    Ok(RequestIdsResponse { request_ids })
}

/// Serve `GetCallbacks`.
pub async fn get_callbacks<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: PoolRef,
) -> Result<RequestIdsResponse, ErrorBody> {
    let request_ids = scheduler.get_callbacks(&req.pool_id).await?;
    Ok(RequestIdsResponse { request_ids })
}

/// Create a pool.
pub async fn create_pool<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: CreatePoolRequest,
) -> Result<Ack, ErrorBody> {
    scheduler.create_pool(&req.pool_id, req.settings).await?;
    Ok(ACK)
}

/// Change pool settings.
pub async fn update_pool<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: UpdatePoolRequest,
) -> Result<Ack, ErrorBody> {
    scheduler.update_pool(&req.pool_id, req.settings).await?;
    Ok(ACK)
}

/// Delete a pool.
pub async fn delete_pool<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: PoolRef,
) -> Result<Ack, ErrorBody> {
    scheduler.delete_pool(&req.pool_id).await?;
    Ok(ACK)
}

/// Wipe a pool.
pub async fn wipe_pool<S: Spawn>(scheduler: &Scheduler<S>, req: PoolRef) -> Result<Ack, ErrorBody> {
    scheduler.wipe_pool(&req.pool_id).await?;
    Ok(ACK)
}

/// Create or change an account.
pub async fn upsert_account<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: UpsertAccountRequest,
) -> Result<Ack, ErrorBody> {
    scheduler
        .upsert_account(&req.pool_id, &req.account_id, req.config)
        .await?;
    Ok(ACK)
}

/// Delete an account.
pub async fn delete_account<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: DeleteAccountRequest,
) -> Result<Ack, ErrorBody> {
    scheduler
        .delete_account(&req.pool_id, &req.account_id)
        .await?;
    Ok(ACK)
}

/// List accounts with balances.
pub async fn list_accounts<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: PoolRef,
) -> Result<ListAccountsResponse, ErrorBody> {
    let accounts = scheduler.list_accounts(&req.pool_id).await?;
    Ok(ListAccountsResponse { accounts })
}

/// Dump a pool for debugging.
pub async fn inspect_pool<S: Spawn>(
    scheduler: &Scheduler<S>,
    req: PoolRef,
) -> Result<Inspection, ErrorBody> {
    Ok(scheduler.inspect(&req.pool_id).await?)
}

/// List pools.
pub async fn list_pools<S: Spawn>(scheduler: &Scheduler<S>) -> Result<ListPoolsResponse, ErrorBody> {
    let pools = scheduler.list_pools().await?;
    Ok(ListPoolsResponse { pools })
}

/// Return a health payload.
pub const fn health() -> Health {
    Health { ok: true }
}
