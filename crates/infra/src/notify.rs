//! Translate committed state deltas into notifications.

use tracing::debug;

use dagops_core::{JobId, JobName, State};
use dagops_events::{StateChanged, StateNotifier};
use dagops_jobs::StateDelta;

use crate::store::TaskRef;

/// Publish `changes` for one job. Called only after the unit of work that
/// produced them has committed.
pub(crate) fn publish<N: StateNotifier + ?Sized>(
    notifier: &N,
    job_id: &JobId,
    job_name: Option<&JobName>,
    changes: &[StateDelta],
) {
    for change in changes {
        let event = match change {
            StateDelta::Task(task_id, state) => {
                StateChanged::task(job_id.clone(), task_id.clone(), *state)
            }
            StateDelta::Job(state) => StateChanged::job(job_id.clone(), job_name.cloned(), *state),
        };
        debug!(job_id = %job_id, state = %event.state(), task_id = ?event.task_id(), "state changed");
        notifier.notify(&event);
    }
}

/// Job-level notification for set-based loop steps, which do not load the job.
pub(crate) fn publish_jobs<N: StateNotifier + ?Sized>(
    notifier: &N,
    job_ids: &[JobId],
    state: State,
) {
    for job_id in job_ids {
        notifier.notify(&StateChanged::job(job_id.clone(), None, state));
    }
}

/// Task-level notification for set-based loop steps.
pub(crate) fn publish_tasks<N: StateNotifier + ?Sized>(
    notifier: &N,
    tasks: &[TaskRef],
    state: State,
) {
    for task in tasks {
        notifier.notify(&StateChanged::task(
            task.job_id.clone(),
            task.task_id.clone(),
            state,
        ));
    }
}
