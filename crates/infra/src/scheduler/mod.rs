//! Background loops driving jobs forward.
//!
//! The [`JobLoop`] advances job states and releases tasks; the [`TaskLoop`]
//! claims released tasks and runs them. Both are plain [`EventLoop`]s that
//! back off while idle and can be started and stopped at runtime. Several
//! engines may share one store: claims never overlap.

pub mod event_loop;
pub mod expiry;
pub mod job_loop;
pub mod pause;
pub mod task_loop;

use std::sync::Arc;

use dagops_events::StateNotifier;

use crate::config::EngineConfig;
use crate::processing::TaskProcessingService;
use crate::store::JobStore;

pub use event_loop::{EventLoop, EventLoopStatus, LoopBody};
pub use expiry::ExpirySweep;
pub use job_loop::{JobLoop, JobLoopPass};
pub use pause::Pause;
pub use task_loop::TaskLoop;

/// The job loop and the task loop of one process.
pub struct Engine<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    job_loop: EventLoop<JobLoop<S, N>>,
    task_loop: EventLoop<TaskLoop<S, N>>,
}

impl<S, N> Engine<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    pub fn new(service: Arc<TaskProcessingService<S, N>>, config: &EngineConfig) -> Self {
        let job_loop = EventLoop::new(
            Arc::new(JobLoop::new(Arc::clone(&service))),
            config.min_pause,
            config.job_loop_max_pause,
        );
        let task_loop = EventLoop::new(
            Arc::new(TaskLoop::new(
                service,
                config.task_slots,
                config.retry_policy(),
                ExpirySweep::new(config.expiry_window, config.expiry_interval),
            )),
            config.min_pause,
            config.task_loop_max_pause,
        );
        Self {
            job_loop,
            task_loop,
        }
    }

    pub fn job_loop(&self) -> &EventLoop<JobLoop<S, N>> {
        &self.job_loop
    }

    pub fn task_loop(&self) -> &EventLoop<TaskLoop<S, N>> {
        &self.task_loop
    }

    pub fn start(&self) {
        self.job_loop.start();
        self.task_loop.start();
    }

    pub fn stop(&self) {
        self.job_loop.stop();
        self.task_loop.stop();
    }

    /// Returns `false` if either loop task ended abnormally.
    pub async fn join(&self) -> bool {
        let jobs = self.job_loop.join().await;
        let tasks = self.task_loop.join().await;
        jobs && tasks
    }

    pub fn status(&self) -> Vec<EventLoopStatus> {
        vec![self.job_loop.status(), self.task_loop.status()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use dagops_core::{JobId, State, TaskId};
    use dagops_events::BroadcastNotifier;
    use dagops_jobs::{Job, JobSchedule, JobSubmission, TaskSubmission, TransitionSubmission};

    use crate::processor::ProcessorRegistry;
    use crate::store::InMemoryJobStore;

    type Service = TaskProcessingService<Arc<InMemoryJobStore>, Arc<BroadcastNotifier>>;

    fn tid(job_id: &str, id: &str) -> TaskId {
        format!("{job_id}.{id}").parse().unwrap()
    }

    fn jid(id: &str) -> JobId {
        id.parse().unwrap()
    }

    /// start -> {a, b} -> join -> end; `a` optionally a canary.
    fn fork_join(job_id: &str, canary: bool) -> Job {
        let task = |id: &str| TaskSubmission {
            canary: canary && id == "a",
            ..TaskSubmission::new(tid(job_id, id), "noop", id)
        };
        let edge = |from: &str, to: &str| TransitionSubmission::new(tid(job_id, from), tid(job_id, to));
        JobSubmission {
            application: "upgrade".into(),
            job_type: "rolling".into(),
            name: job_id.into(),
            group_id: None,
            schedule: JobSchedule::default(),
            tasks: ["start", "a", "b", "join", "end"].into_iter().map(task).collect(),
            transitions: vec![
                edge("start", "a"),
                edge("start", "b"),
                edge("a", "join"),
                edge("b", "join"),
                edge("join", "end"),
            ],
        }
        .into_job(jid(job_id), None)
        .unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_task_slots(2)
            .with_min_pause(Duration::from_millis(1))
            .with_job_loop_max_pause(Duration::from_millis(5))
            .with_task_loop_max_pause(Duration::from_millis(5))
    }

    async fn service_with(jobs: Vec<Job>) -> Arc<Service> {
        let store = InMemoryJobStore::arc();
        for job in jobs {
            let job_id = job.id().clone();
            store.insert_job(job).await.unwrap();
            store
                .update_job(&job_id, |job| job.commit(Utc::now()))
                .await
                .unwrap();
        }
        Arc::new(TaskProcessingService::new(
            store,
            Arc::new(ProcessorRegistry::new()),
            Arc::new(BroadcastNotifier::new()),
        ))
    }

    async fn wait_for_state(service: &Service, job_id: &str, state: State) -> Job {
        for _ in 0..1000 {
            let job = service.store().load_job(&jid(job_id)).await.unwrap().unwrap();
            if job.state() == state {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {state}");
    }

    #[tokio::test]
    async fn engine_runs_fork_join_jobs_to_completion() {
        let service = service_with(vec![fork_join("j1", false), fork_join("j2", false)]).await;
        let events = service.notifier().subscribe();
        let engine = Engine::new(Arc::clone(&service), &config());
        engine.start();

        for job_id in ["j1", "j2"] {
            let job = wait_for_state(&service, job_id, State::Completed).await;
            assert!(job.all_tasks_completed());
        }
        engine.stop();
        assert!(engine.join().await);

        let completed_tasks = events
            .drain()
            .iter()
            .filter(|e| e.task_id().is_some() && e.state() == State::Completed)
            .count();
        assert_eq!(completed_tasks, 10);
        assert!(engine.status().iter().all(|s| !s.enabled));
    }

    #[tokio::test]
    async fn canary_job_waits_for_confirmation() {
        let service = service_with(vec![fork_join("c1", true)]).await;
        let engine = Engine::new(Arc::clone(&service), &config());
        engine.start();

        let job = wait_for_state(&service, "c1", State::Confirm).await;
        assert_eq!(job.task(&tid("c1", "a")).unwrap().state(), State::Confirm);
        assert_ne!(job.task(&tid("c1", "end")).unwrap().state(), State::Completed);

        assert!(service.confirm(&jid("c1")).await.unwrap());
        wait_for_state(&service, "c1", State::Completed).await;

        engine.stop();
        engine.join().await;
    }

    #[tokio::test]
    async fn engine_status_reports_both_loops() {
        let service = service_with(Vec::new()).await;
        let engine = Engine::new(service, &config());
        engine.start();

        let names: Vec<String> = engine.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["job-loop".to_string(), "task-loop".to_string()]);
        assert!(engine.job_loop().is_enabled());
        assert!(engine.task_loop().is_enabled());

        engine.stop();
        engine.join().await;
    }
}
