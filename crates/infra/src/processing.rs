//! Task execution protocol.
//!
//! Running a task takes three steps:
//!
//! 1. under the job lock: check the task may run and mark it ACTIVE;
//! 2. without any lock: resolve and invoke the processor;
//! 3. under the job lock again: apply the outcome, unless the task was
//!    cancelled or otherwise moved on in the meantime.
//!
//! Applying an outcome also folds it into the job: a failure fails the job
//! and skips its pending tasks, a completion may complete the job, and a
//! completed canary task parks the job in CONFIRM.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use dagops_core::{
    DomainError, DomainResult, JobApplication, JobId, JobName, JobType, State, TaskId,
};
use dagops_events::StateNotifier;
use dagops_jobs::{Job, Task};

use crate::error::EngineResult;
use crate::notify;
use crate::processor::{ProcessorError, ProcessorRegistry, TaskOutcome};
use crate::store::{JobStore, TaskRef};

/// What the processor needs, captured while the job lock is held.
#[derive(Debug, Clone)]
struct Dispatch {
    task: Task,
    application: JobApplication,
    job_type: JobType,
}

impl Dispatch {
    fn capture(job: &Job, task_id: &TaskId) -> DomainResult<Self> {
        Ok(Self {
            task: job.require_task(task_id)?.clone(),
            application: job.application().clone(),
            job_type: job.job_type().clone(),
        })
    }
}

/// Executes tasks and applies externally reported task states.
pub struct TaskProcessingService<S, N> {
    store: S,
    processors: Arc<ProcessorRegistry>,
    notifier: N,
}

impl<S, N> TaskProcessingService<S, N>
where
    S: JobStore,
    N: StateNotifier,
{
    pub fn new(store: S, processors: Arc<ProcessorRegistry>, notifier: N) -> Self {
        Self {
            store,
            processors,
            notifier,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Lock and mutate one job, then publish what changed.
    pub(crate) async fn mutate<R, F>(&self, job_id: &JobId, f: F) -> EngineResult<R>
    where
        F: FnOnce(&mut Job) -> DomainResult<R> + Send,
        R: Send,
    {
        let (result, job_name, changes) = self
            .store
            .update_job(job_id, |job| {
                let before = job.snapshot();
                let result = f(job)?;
                Ok((result, job.name().clone(), job.changes_since(&before)))
            })
            .await?;
        notify::publish(&self.notifier, job_id, Some(&job_name), &changes);
        Ok(result)
    }

    /// Run a task on request. The task must be eligible: READY, or WAITING
    /// with every predecessor completed, in an ACTIVE job.
    ///
    /// Returns the task state after the outcome was applied, or `None` if
    /// the task moved on while its processor ran.
    #[instrument(skip(self), fields(job_id = %job_id, task_id = %task_id), err)]
    pub async fn execute_task(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
    ) -> EngineResult<Option<State>> {
        let dispatch = self
            .mutate(job_id, |job| {
                if !job.is_running() {
                    return Err(DomainError::conflict(format!(
                        "job {} ({}) is {}; its tasks cannot run",
                        job.name(),
                        job.id(),
                        job.state()
                    )));
                }
                if !job.is_eligible_for_execution(task_id) {
                    let state = job.require_task(task_id)?.state();
                    return Err(DomainError::conflict(format!(
                        "task {task_id} is not eligible for execution in state {state}"
                    )));
                }
                job.set_task_state(task_id, State::Active)?;
                Dispatch::capture(job, task_id)
            })
            .await?;

        self.run(job_id, dispatch).await
    }

    /// Run a task claimed by the task loop; the claim already made it ACTIVE.
    ///
    /// If the job stopped running since the claim, the task goes back to
    /// READY and nothing runs.
    #[instrument(skip(self), fields(job_id = %claim.job_id, task_id = %claim.task_id), err)]
    pub async fn execute_claimed(&self, claim: &TaskRef) -> EngineResult<Option<State>> {
        let task_id = &claim.task_id;
        let dispatch = self
            .mutate(&claim.job_id, |job| {
                if job.require_task(task_id)?.state() != State::Active {
                    return Ok(None);
                }
                if !job.is_running() {
                    job.set_task_state(task_id, State::Ready)?;
                    return Ok(None);
                }
                Dispatch::capture(job, task_id).map(Some)
            })
            .await?;

        match dispatch {
            Some(dispatch) => self.run(&claim.job_id, dispatch).await,
            None => {
                debug!("claimed task no longer runnable");
                Ok(None)
            }
        }
    }

    async fn run(&self, job_id: &JobId, dispatch: Dispatch) -> EngineResult<Option<State>> {
        let task_id = dispatch.task.id().clone();
        let outcome = self.invoke(dispatch).await?;

        if outcome.state == State::Active {
            debug!(task_id = %task_id, "task pending an asynchronous report");
            return Ok(Some(State::Active));
        }

        self.mutate(job_id, |job| {
            let current = job.require_task(&task_id)?.state();
            if !matches!(current, State::Active | State::Timeout) {
                debug!(task_id = %task_id, state = %current, "discarding outcome of a task that moved on");
                return Ok(None);
            }
            apply_outcome(job, &task_id, outcome.state).map(Some)
        })
        .await
    }

    async fn invoke(&self, dispatch: Dispatch) -> EngineResult<TaskOutcome> {
        let Dispatch {
            task,
            application,
            job_type,
        } = dispatch;

        let Some(processor) = self
            .processors
            .resolve(&application, &job_type, task.task_type())
        else {
            debug!(task_id = %task.id(), task_type = %task.task_type(), "no processor; completing task");
            return Ok(TaskOutcome::completed());
        };

        let outcome = tokio::task::spawn_blocking(move || processor.execute(&task))
            .await
            .map_err(|e| ProcessorError::Panicked(e.to_string()))??;

        if outcome.is_reportable() {
            Ok(outcome)
        } else {
            warn!(state = %outcome.state, "processor reported an invalid state; failing task");
            Ok(TaskOutcome::failed(format!(
                "processor reported invalid state {}",
                outcome.state
            )))
        }
    }

    /// Apply a state reported from outside (a remote agent, an operator).
    ///
    /// Reports for terminated tasks are ignored and yield `None`. COMPLETED
    /// on a task in CONFIRM confirms that task.
    #[instrument(skip(self), fields(job_id = %job_id, task_id = %task_id), err)]
    pub async fn update_task(
        &self,
        job_id: &JobId,
        task_id: &TaskId,
        state: State,
    ) -> EngineResult<Option<State>> {
        if state == State::New {
            return Err(DomainError::validation("a task cannot be reset to NEW").into());
        }
        self.mutate(job_id, |job| {
            let current = job.require_task(task_id)?.state();
            if current.is_terminal() {
                debug!(state = %current, "ignoring update of a terminated task");
                return Ok(None);
            }
            apply_outcome(job, task_id, state).map(Some)
        })
        .await
    }

    /// Confirm every task waiting in CONFIRM and release the job.
    ///
    /// Returns `false` when the job was not awaiting confirmation.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn confirm(&self, job_id: &JobId) -> EngineResult<bool> {
        self.mutate(job_id, |job| {
            if job.state() != State::Confirm {
                return Ok(false);
            }
            job.complete_confirmed_tasks();
            job.confirmed();
            job.completed();
            Ok(true)
        })
        .await
    }

    /// Mark a job FAILED in a fresh unit of work, optionally failing the task
    /// whose execution could not be completed.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn fail_job(&self, job_id: &JobId, failed_task: Option<&TaskId>) -> EngineResult<()> {
        let job_name: JobName = self
            .mutate(job_id, |job| {
                if let Some(task_id) = failed_task {
                    if job.require_task(task_id)?.state() == State::Active {
                        job.set_task_state(task_id, State::Failed)?;
                    }
                }
                if !job.is_terminated() {
                    job.failed();
                }
                Ok(job.name().clone())
            })
            .await?;
        info!(job_name = %job_name, "job failed");
        Ok(())
    }
}

/// Fold a task outcome into the job and return the state the task ended in.
fn apply_outcome(job: &mut Job, task_id: &TaskId, state: State) -> DomainResult<State> {
    let task = job.require_task(task_id)?;
    let current = task.state();
    let canary = task.is_canary();

    let applied = match (state, current) {
        (State::Completed, State::Active) if canary => {
            job.set_task_state(task_id, State::Confirm)?;
            if job.is_running() {
                job.await_confirmation();
            }
            State::Confirm
        }
        (State::Completed, State::Confirm) => {
            job.set_task_state(task_id, State::Completed)?;
            job.confirmed();
            State::Completed
        }
        (state, _) => {
            job.set_task_state(task_id, state)?;
            state
        }
    };

    if applied.is_failure() {
        if !job.is_terminated() {
            job.failed();
        }
    } else if applied == State::Completed {
        job.completed();
    }
    Ok(applied)
}
