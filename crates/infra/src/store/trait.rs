use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{DomainError, DomainResult, JobId, TaskId};
use dagops_jobs::{Job, JobQuery, JobSettings};

/// Address of a task: owning job plus task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub job_id: JobId,
    pub task_id: TaskId,
}

impl TaskRef {
    pub fn new(job_id: JobId, task_id: TaskId) -> Self {
        Self { job_id, task_id }
    }
}

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The mutation closure refused the change. Nothing was persisted.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Connection, pool or transaction failure. Safe to retry.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted row could not be mapped back into the model.
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Durable home of job graphs.
///
/// Two concurrency primitives carry the engine:
///
/// - [`JobStore::update_job`] is "lock and mutate": it takes a pessimistic
///   lock on one job, hands the loaded graph to a closure and persists the
///   result atomically. All task state changes within a job are linearized
///   through it. If the closure fails, nothing is written.
/// - [`JobStore::claim_ready_tasks`] atomically moves up to `limit` READY
///   tasks of ACTIVE jobs to ACTIVE, skipping anything another claimant holds.
///   Concurrent claims never block each other and never overlap.
///
/// The remaining set-based operations back the job loop steps; each returns
/// what it changed so callers can count and report it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly built job graph.
    async fn insert_job(&self, job: Job) -> Result<(), StoreError>;

    /// Read a job without locking it.
    async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Lock `job_id`, apply `f` and persist the result in one unit of work.
    async fn update_job<F, R>(&self, job_id: &JobId, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<R> + Send,
        R: Send;

    /// Delete a terminated job with its tasks and transitions. The state check
    /// and the delete happen under the job lock. Returns `false` if unknown and
    /// a `Domain(Conflict)` if the job has not terminated.
    async fn remove_job(&self, job_id: &JobId) -> Result<bool, StoreError>;

    async fn find_job_by_task(&self, task_id: &TaskId) -> Result<Option<JobId>, StoreError>;

    /// Job headers matching `query`, most recently scheduled first.
    async fn find_jobs(&self, query: &JobQuery, limit: usize)
    -> Result<Vec<JobSettings>, StoreError>;

    /// READY jobs scheduled at or before `now` become ACTIVE.
    async fn start_scheduled_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError>;

    /// WAITING tasks of ACTIVE jobs whose predecessors all completed become READY.
    async fn mark_ready_tasks(&self) -> Result<Vec<TaskRef>, StoreError>;

    /// Jobs with a FAILED or REJECTED task become FAILED; their READY and
    /// WAITING tasks become SKIPPED.
    async fn mark_failed_jobs(&self) -> Result<Vec<JobId>, StoreError>;

    /// ACTIVE jobs with a task in CONFIRM become CONFIRM.
    async fn mark_confirm_jobs(&self) -> Result<Vec<JobId>, StoreError>;

    /// Running jobs whose tasks all completed become COMPLETED.
    async fn mark_completed_jobs(&self) -> Result<Vec<JobId>, StoreError>;

    /// Skip-locked claim of up to `limit` READY tasks (READY → ACTIVE).
    async fn claim_ready_tasks(&self, limit: usize) -> Result<Vec<TaskRef>, StoreError>;

    /// ACTIVE tasks last modified before `cutoff` become TIMEOUT.
    async fn expire_active_tasks(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<TaskRef>, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore,
{
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        (**self).insert_job(job).await
    }

    async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        (**self).load_job(job_id).await
    }

    async fn update_job<F, R>(&self, job_id: &JobId, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<R> + Send,
        R: Send,
    {
        (**self).update_job(job_id, f).await
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<bool, StoreError> {
        (**self).remove_job(job_id).await
    }

    async fn find_job_by_task(&self, task_id: &TaskId) -> Result<Option<JobId>, StoreError> {
        (**self).find_job_by_task(task_id).await
    }

    async fn find_jobs(
        &self,
        query: &JobQuery,
        limit: usize,
    ) -> Result<Vec<JobSettings>, StoreError> {
        (**self).find_jobs(query, limit).await
    }

    async fn start_scheduled_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        (**self).start_scheduled_jobs(now).await
    }

    async fn mark_ready_tasks(&self) -> Result<Vec<TaskRef>, StoreError> {
        (**self).mark_ready_tasks().await
    }

    async fn mark_failed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        (**self).mark_failed_jobs().await
    }

    async fn mark_confirm_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        (**self).mark_confirm_jobs().await
    }

    async fn mark_completed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        (**self).mark_completed_jobs().await
    }

    async fn claim_ready_tasks(&self, limit: usize) -> Result<Vec<TaskRef>, StoreError> {
        (**self).claim_ready_tasks(limit).await
    }

    async fn expire_active_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError> {
        (**self).expire_active_tasks(cutoff).await
    }
}
