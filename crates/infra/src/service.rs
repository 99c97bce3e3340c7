//! Job service: the operations exposed to callers outside the engine.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use dagops_core::{DomainError, ElementGroupId, JobId, State, TaskId, UserName};
use dagops_events::StateNotifier;
use dagops_jobs::{
    Job, JobInfo, JobQuery, JobSettings, JobSettingsUpdate, JobSubmission, JobTaskInfo,
    TaskSummary, render_dot,
};

use crate::error::EngineResult;
use crate::processing::TaskProcessingService;
use crate::store::JobStore;

/// Map an HTTP-style status code reported by a remote agent to a task state.
///
/// `202 Accepted` is not an outcome and counts as a failure like every other
/// code without a mapping.
pub fn state_for_status(status_code: u16) -> State {
    match status_code {
        200 | 201 | 204 => State::Completed,
        401 | 403 | 409 => State::Rejected,
        _ => State::Failed,
    }
}

/// Create, control and inspect jobs.
///
/// Every write goes through the store's lock-and-mutate primitive and
/// publishes the resulting state changes after it committed.
pub struct JobService<S, N> {
    processing: Arc<TaskProcessingService<S, N>>,
}

impl<S, N> Clone for JobService<S, N> {
    fn clone(&self) -> Self {
        Self {
            processing: Arc::clone(&self.processing),
        }
    }
}

impl<S, N> JobService<S, N>
where
    S: JobStore,
    N: StateNotifier,
{
    pub fn new(processing: Arc<TaskProcessingService<S, N>>) -> Self {
        Self { processing }
    }

    pub fn processing(&self) -> &Arc<TaskProcessingService<S, N>> {
        &self.processing
    }

    fn store(&self) -> &S {
        self.processing.store()
    }

    async fn load(&self, job_id: &JobId) -> EngineResult<Job> {
        self.store()
            .load_job(job_id)
            .await?
            .ok_or_else(|| DomainError::not_found("job", job_id).into())
    }

    // --- writes ---------------------------------------------------------

    /// Create a job from `submission`, or update the settings of an existing
    /// one. Without an id a fresh one is generated.
    ///
    /// For an existing job only name and schedule are taken from the
    /// submission; its graph is fixed once stored.
    #[instrument(skip(self, submission), fields(job_name = %submission.name), err)]
    pub async fn store_job(
        &self,
        job_id: Option<JobId>,
        submission: JobSubmission,
        owner: Option<UserName>,
    ) -> EngineResult<JobId> {
        let job_id = job_id.unwrap_or_default();
        if self.store().load_job(&job_id).await?.is_some() {
            let update = JobSettingsUpdate {
                name: submission.name,
                schedule: submission.schedule,
            };
            self.store_job_settings(&job_id, update, owner).await?;
            return Ok(job_id);
        }

        let job = submission.into_job(job_id.clone(), owner)?;
        self.store().insert_job(job).await?;
        info!(job_id = %job_id, "job stored");
        Ok(job_id)
    }

    /// Update name, schedule and (if given) owner of a job.
    #[instrument(skip(self, update), err)]
    pub async fn store_job_settings(
        &self,
        job_id: &JobId,
        update: JobSettingsUpdate,
        owner: Option<UserName>,
    ) -> EngineResult<()> {
        self.processing
            .mutate(job_id, |job| job.update_settings(update, owner))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn commit_job(&self, job_id: &JobId) -> EngineResult<()> {
        self.processing
            .mutate(job_id, |job| job.commit(Utc::now()))
            .await?;
        info!(job_id = %job_id, "job committed");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: &JobId) -> EngineResult<()> {
        self.processing.mutate(job_id, Job::cancel).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    /// Returns `false` if the job was neither FAILED nor CANCELLED.
    #[instrument(skip(self), err)]
    pub async fn resume_job(&self, job_id: &JobId) -> EngineResult<bool> {
        let resumed = self.processing.mutate(job_id, Job::resume).await?;
        if resumed {
            info!(job_id = %job_id, "job resumed");
        }
        Ok(resumed)
    }

    pub async fn confirm_job(&self, job_id: &JobId) -> EngineResult<bool> {
        self.processing.confirm(job_id).await
    }

    pub async fn update_task(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        state: State,
    ) -> EngineResult<Option<State>> {
        self.processing.update_task(job_id, task_id, state).await
    }

    /// Apply the result a remote agent reported for a task, mapped through
    /// [`state_for_status`].
    pub async fn report_task_outcome(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        status_code: u16,
    ) -> EngineResult<Option<State>> {
        self.update_task(job_id, task_id, state_for_status(status_code))
            .await
    }

    #[instrument(skip(self, parameters), err)]
    pub async fn set_task_parameters(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        parameters: serde_json::Value,
    ) -> EngineResult<()> {
        self.processing
            .mutate(job_id, |job| job.set_task_parameters(task_id, parameters))
            .await
    }

    /// Delete a terminated job. Unknown ids are ignored and yield `false`.
    #[instrument(skip(self), err)]
    pub async fn remove_job(&self, job_id: &JobId) -> EngineResult<bool> {
        let removed = self.store().remove_job(job_id).await?;
        if removed {
            info!(job_id = %job_id, "job removed");
        }
        Ok(removed)
    }

    // --- reads ----------------------------------------------------------

    pub async fn find_jobs(&self, query: &JobQuery, limit: usize) -> EngineResult<Vec<JobSettings>> {
        Ok(self.store().find_jobs(query, limit).await?)
    }

    /// Committed, not yet terminated jobs of an element group.
    pub async fn group_jobs(&self, group_id: &ElementGroupId) -> EngineResult<Vec<JobSettings>> {
        let query = JobQuery::new()
            .with_group(group_id.clone())
            .with_running_only(true);
        Ok(self.store().find_jobs(&query, usize::MAX).await?)
    }

    /// Locate a task by id alone.
    pub async fn find_task(&self, task_id: &TaskId) -> EngineResult<Option<JobTaskInfo>> {
        let Some(job_id) = self.store().find_job_by_task(task_id).await? else {
            return Ok(None);
        };
        let Some(job) = self.store().load_job(&job_id).await? else {
            return Ok(None);
        };
        Ok(job.task(task_id).map(|task| JobTaskInfo::of(&job, task)))
    }

    pub async fn job_settings(&self, job_id: &JobId) -> EngineResult<JobSettings> {
        Ok(JobSettings::from(&self.load(job_id).await?))
    }

    pub async fn job_info(&self, job_id: &JobId) -> EngineResult<JobInfo> {
        Ok(JobInfo::from(&self.load(job_id).await?))
    }

    /// Tasks reachable from the start task, in traversal order.
    pub async fn job_tasks(&self, job_id: &JobId) -> EngineResult<Vec<TaskSummary>> {
        let job = self.load(job_id).await?;
        Ok(job.ordered_tasks().into_iter().map(TaskSummary::from).collect())
    }

    pub async fn task_info(&self, job_id: &JobId, task_id: &TaskId) -> EngineResult<JobTaskInfo> {
        let job = self.load(job_id).await?;
        let task = job.require_task(task_id)?;
        Ok(JobTaskInfo::of(&job, task))
    }

    /// Graphviz DOT rendering of the job graph, colored by task state.
    pub async fn job_graph(&self, job_id: &JobId) -> EngineResult<String> {
        Ok(render_dot(&self.load(job_id).await?))
    }
}
