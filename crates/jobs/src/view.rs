//! Read-side projections of a [`Job`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{
    ElementGroupId, ElementId, JobApplication, JobId, JobName, JobType, State, TaskId, TaskName,
    TaskType, UserName,
};

use crate::job::Job;
use crate::submission::JobSchedule;
use crate::task::Task;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    pub job_id: JobId,
    pub application: JobApplication,
    pub job_type: JobType,
    pub name: JobName,
    pub owner: Option<UserName>,
    pub group_id: Option<ElementGroupId>,
    pub state: State,
    pub schedule: JobSchedule,
    pub modified_at: DateTime<Utc>,
}

impl From<&Job> for JobSettings {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id().clone(),
            application: job.application().clone(),
            job_type: job.job_type().clone(),
            name: job.name().clone(),
            owner: job.owner().cloned(),
            group_id: job.group_id().cloned(),
            state: job.state(),
            schedule: job.schedule().clone(),
            modified_at: job.modified_at(),
        }
    }
}

/// Task counts by state, over the tasks reachable from the start task.
///
/// `completed` includes tasks parked in CONFIRM (they did their work) and
/// `failed` includes REJECTED tasks. WAITING tasks are counted too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub active: usize,
    pub ready: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub waiting: usize,
}

impl JobProgress {
    pub fn of(job: &Job) -> Self {
        job.ordered_tasks()
            .into_iter()
            .fold(Self::default(), |mut progress, task| {
                match task.state() {
                    State::Active => progress.active += 1,
                    State::Ready => progress.ready += 1,
                    State::Completed | State::Confirm => progress.completed += 1,
                    State::Failed | State::Rejected => progress.failed += 1,
                    State::Timeout => progress.timeout += 1,
                    State::Waiting => progress.waiting += 1,
                    State::New | State::Cancelled | State::Skipped => {}
                }
                progress
            })
    }

    pub fn total(&self) -> usize {
        self.active + self.ready + self.completed + self.failed + self.timeout + self.waiting
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub task_name: TaskName,
    pub state: State,
    pub element: Option<ElementId>,
    pub canary: bool,
    pub modified_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id().clone(),
            task_type: task.task_type().clone(),
            task_name: task.name().clone(),
            state: task.state(),
            element: task.element().cloned(),
            canary: task.is_canary(),
            modified_at: task.modified_at(),
        }
    }
}

/// Job settings, progress and tasks in traversal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub settings: JobSettings,
    pub progress: JobProgress,
    pub tasks: Vec<TaskSummary>,
}

impl From<&Job> for JobInfo {
    fn from(job: &Job) -> Self {
        Self {
            settings: JobSettings::from(job),
            progress: JobProgress::of(job),
            tasks: job.ordered_tasks().into_iter().map(TaskSummary::from).collect(),
        }
    }
}

/// Single task detail, including its owning job's header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTaskInfo {
    pub job_id: JobId,
    pub job_name: JobName,
    pub job_type: JobType,
    pub application: JobApplication,
    #[serde(flatten)]
    pub task: TaskSummary,
    pub parameters: serde_json::Value,
    pub successors: Vec<TaskId>,
    pub predecessors: Vec<TaskId>,
}

impl JobTaskInfo {
    pub fn of(job: &Job, task: &Task) -> Self {
        Self {
            job_id: job.id().clone(),
            job_name: job.name().clone(),
            job_type: job.job_type().clone(),
            application: job.application().clone(),
            task: TaskSummary::from(task),
            parameters: task.parameters().clone(),
            successors: job.successors(task.id()).iter().map(|t| t.to.clone()).collect(),
            predecessors: job.predecessors(task.id()).to_vec(),
        }
    }
}
