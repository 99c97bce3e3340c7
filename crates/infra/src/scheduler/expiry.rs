//! Expiry sweep for tasks stuck in ACTIVE.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;

use dagops_core::State;
use dagops_events::StateNotifier;

use crate::error::EngineResult;
use crate::notify;
use crate::store::{JobStore, TaskRef};

/// Moves ACTIVE tasks whose last modification is older than `window` to
/// TIMEOUT. A claimed task whose worker died is recovered this way.
#[derive(Debug)]
pub struct ExpirySweep {
    window: Duration,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl ExpirySweep {
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self {
            window,
            interval,
            last_run: Mutex::new(None),
        }
    }

    /// Oldest `modified_at` an ACTIVE task may have at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run.lock() {
            Ok(last) => last.is_none_or(|at| now.duration_since(at) >= self.interval),
            Err(_) => true,
        }
    }

    pub async fn sweep<S, N>(&self, store: &S, notifier: &N) -> EngineResult<Vec<TaskRef>>
    where
        S: JobStore,
        N: StateNotifier,
    {
        let expired = store.expire_active_tasks(self.cutoff(Utc::now())).await?;
        if let Ok(mut last) = self.last_run.lock() {
            *last = Some(Instant::now());
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired active tasks");
        }
        notify::publish_tasks(notifier, &expired, State::Timeout);
        Ok(expired)
    }

    pub async fn sweep_if_due<S, N>(&self, store: &S, notifier: &N) -> EngineResult<Vec<TaskRef>>
    where
        S: JobStore,
        N: StateNotifier,
    {
        if self.is_due(Instant::now()) {
            self.sweep(store, notifier).await
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagops_events::NoopNotifier;
    use dagops_jobs::{Job, Task};

    use crate::store::InMemoryJobStore;

    #[test]
    fn cutoff_subtracts_the_window() {
        let sweep = ExpirySweep::new(Duration::from_secs(15 * 60), Duration::from_secs(60));
        let now = Utc::now();
        assert_eq!(sweep.cutoff(now), now - chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn sweeps_stale_tasks_once_per_interval() {
        let store = InMemoryJobStore::new();
        let job_id: dagops_core::JobId = "job-1".parse().unwrap();
        let mut job = Job::new(job_id.clone(), "upgrade".into(), "rolling".into(), "n".into());
        job.add_task(
            Task::new(job_id.clone(), "stale".parse().unwrap(), "noop".into(), "s".into())
                .restore_state(State::Active, Utc::now() - chrono::Duration::minutes(20)),
        )
        .unwrap();
        job.add_task(
            Task::new(job_id.clone(), "fresh".parse().unwrap(), "noop".into(), "f".into())
                .restore_state(State::Active, Utc::now() - chrono::Duration::minutes(5)),
        )
        .unwrap();
        store.insert_job(job).await.unwrap();

        let sweep = ExpirySweep::new(Duration::from_secs(15 * 60), Duration::from_secs(3600));
        assert!(sweep.is_due(Instant::now()));

        let expired = sweep.sweep_if_due(&store, &NoopNotifier).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id.as_str(), "stale");

        assert!(!sweep.is_due(Instant::now()));
        assert!(sweep.sweep_if_due(&store, &NoopNotifier).await.unwrap().is_empty());
    }
}
