use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{JobId, JobName, State, TaskId};

/// A committed job or task state transition.
///
/// Notifications are facts: they are emitted only after the unit of work that
/// produced them has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChanged {
    Job {
        job_id: JobId,
        job_name: Option<JobName>,
        state: State,
        occurred_at: DateTime<Utc>,
    },
    Task {
        job_id: JobId,
        task_id: TaskId,
        state: State,
        occurred_at: DateTime<Utc>,
    },
}

impl StateChanged {
    pub fn job(job_id: JobId, job_name: Option<JobName>, state: State) -> Self {
        Self::Job {
            job_id,
            job_name,
            state,
            occurred_at: Utc::now(),
        }
    }

    pub fn task(job_id: JobId, task_id: TaskId, state: State) -> Self {
        Self::Task {
            job_id,
            task_id,
            state,
            occurred_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            StateChanged::Job { job_id, .. } | StateChanged::Task { job_id, .. } => job_id,
        }
    }

    pub fn state(&self) -> State {
        match self {
            StateChanged::Job { state, .. } | StateChanged::Task { state, .. } => *state,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            StateChanged::Task { task_id, .. } => Some(task_id),
            StateChanged::Job { .. } => None,
        }
    }
}
