//! Job loop: advances job and task states that need no processor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use dagops_core::State;
use dagops_events::StateNotifier;

use crate::error::EngineResult;
use crate::notify;
use crate::processing::TaskProcessingService;
use crate::store::JobStore;

use super::event_loop::LoopBody;

/// Counts of what one pass of the job loop changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobLoopPass {
    pub started: usize,
    pub ready: usize,
    pub failed: usize,
    pub confirm: usize,
    pub completed: usize,
}

impl JobLoopPass {
    pub fn total(&self) -> usize {
        self.started + self.ready + self.failed + self.confirm + self.completed
    }
}

/// One pass runs, in order: start due jobs, release tasks whose predecessors
/// completed, fail jobs with a failed task, park jobs awaiting confirmation
/// and complete finished jobs. Each step is a set-based store operation.
pub struct JobLoop<S, N> {
    service: Arc<TaskProcessingService<S, N>>,
}

impl<S, N> JobLoop<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    pub fn new(service: Arc<TaskProcessingService<S, N>>) -> Self {
        Self { service }
    }

    pub async fn pass(&self) -> EngineResult<JobLoopPass> {
        let store = self.service.store();
        let notifier = self.service.notifier();

        let started = store.start_scheduled_jobs(Utc::now()).await?;
        notify::publish_jobs(notifier, &started, State::Active);

        let ready = store.mark_ready_tasks().await?;
        notify::publish_tasks(notifier, &ready, State::Ready);

        let failed = store.mark_failed_jobs().await?;
        notify::publish_jobs(notifier, &failed, State::Failed);

        let confirm = store.mark_confirm_jobs().await?;
        notify::publish_jobs(notifier, &confirm, State::Confirm);

        let completed = store.mark_completed_jobs().await?;
        notify::publish_jobs(notifier, &completed, State::Completed);

        let pass = JobLoopPass {
            started: started.len(),
            ready: ready.len(),
            failed: failed.len(),
            confirm: confirm.len(),
            completed: completed.len(),
        };
        if pass.total() > 0 {
            debug!(?pass, "job loop pass");
        }
        Ok(pass)
    }
}

#[async_trait]
impl<S, N> LoopBody for JobLoop<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    fn name(&self) -> &'static str {
        "job-loop"
    }

    async fn iterate(&self) -> EngineResult<bool> {
        Ok(self.pass().await?.total() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagops_core::{JobId, TaskId};
    use dagops_events::BroadcastNotifier;
    use dagops_jobs::{Job, JobSchedule, JobSubmission, TaskSubmission, TransitionSubmission};

    use crate::processor::ProcessorRegistry;
    use crate::store::InMemoryJobStore;

    type Service = TaskProcessingService<Arc<InMemoryJobStore>, Arc<BroadcastNotifier>>;

    fn tid(id: &str) -> TaskId {
        id.parse().unwrap()
    }

    fn jid() -> JobId {
        "job-1".parse().unwrap()
    }

    fn pair() -> Job {
        JobSubmission {
            application: "upgrade".into(),
            job_type: "rolling".into(),
            name: "pair".into(),
            group_id: None,
            schedule: JobSchedule::default(),
            tasks: vec![
                TaskSubmission::new(tid("start"), "noop", "start"),
                TaskSubmission::new(tid("end"), "noop", "end"),
            ],
            transitions: vec![TransitionSubmission::new(tid("start"), tid("end"))],
        }
        .into_job(jid(), None)
        .unwrap()
    }

    async fn committed_service() -> Arc<Service> {
        let store = InMemoryJobStore::arc();
        store.insert_job(pair()).await.unwrap();
        store
            .update_job(&jid(), |job| job.commit(Utc::now()))
            .await
            .unwrap();
        Arc::new(TaskProcessingService::new(
            store,
            Arc::new(ProcessorRegistry::new()),
            Arc::new(BroadcastNotifier::new()),
        ))
    }

    #[tokio::test]
    async fn pass_starts_due_job_and_releases_entry_task() {
        let service = committed_service().await;
        let events = service.notifier().subscribe();
        let job_loop = JobLoop::new(Arc::clone(&service));

        let pass = job_loop.pass().await.unwrap();

        assert_eq!(pass.started, 1);
        assert_eq!(pass.ready, 1);
        assert!(job_loop.iterate().await.is_ok());
        let job = service.store().load_job(&jid()).await.unwrap().unwrap();
        assert_eq!(job.state(), State::Active);
        assert_eq!(job.task(&tid("start")).unwrap().state(), State::Ready);
        assert_eq!(job.task(&tid("end")).unwrap().state(), State::Waiting);

        let states: Vec<State> = events.drain().iter().map(|e| e.state()).collect();
        assert_eq!(states, vec![State::Active, State::Ready]);
    }

    #[tokio::test]
    async fn idle_pass_reports_no_work() {
        let service = committed_service().await;
        let job_loop = JobLoop::new(Arc::clone(&service));
        job_loop.pass().await.unwrap();

        assert!(!job_loop.iterate().await.unwrap());
    }

    #[tokio::test]
    async fn completed_tasks_complete_the_job() {
        let service = committed_service().await;
        let job_loop = JobLoop::new(Arc::clone(&service));
        job_loop.pass().await.unwrap();

        for id in ["start", "end"] {
            service
                .store()
                .update_job(&jid(), |job| job.set_task_state(&tid(id), State::Completed))
                .await
                .unwrap();
        }
        let pass = job_loop.pass().await.unwrap();

        assert_eq!(pass.completed, 1);
        let job = service.store().load_job(&jid()).await.unwrap().unwrap();
        assert_eq!(job.state(), State::Completed);
    }
}
