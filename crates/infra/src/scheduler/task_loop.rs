//! Task loop: claims READY tasks and runs them on a bounded worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use dagops_core::State;
use dagops_events::StateNotifier;

use crate::error::EngineResult;
use crate::notify;
use crate::processing::TaskProcessingService;
use crate::retry::{RetryPolicy, with_retry};
use crate::store::{JobStore, TaskRef};

use super::event_loop::LoopBody;
use super::expiry::ExpirySweep;

/// Claims at most as many tasks as there are free worker slots. Every
/// claimed task runs on its own tokio task holding one slot; a task whose
/// execution keeps failing fails its job. Failing the job is retried with
/// the same policy as the execution.
pub struct TaskLoop<S, N> {
    service: Arc<TaskProcessingService<S, N>>,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
    expiry: ExpirySweep,
}

impl<S, N> TaskLoop<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    pub fn new(
        service: Arc<TaskProcessingService<S, N>>,
        task_slots: usize,
        retry: RetryPolicy,
        expiry: ExpirySweep,
    ) -> Self {
        Self {
            service,
            slots: Arc::new(Semaphore::new(task_slots.max(1))),
            retry,
            expiry,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Claim and dispatch ready tasks. Returns the claims handed to workers.
    pub async fn dispatch(&self) -> EngineResult<Vec<TaskRef>> {
        let free = self.free_slots();
        if free == 0 {
            return Ok(Vec::new());
        }

        let claims = self.service.store().claim_ready_tasks(free).await?;
        notify::publish_tasks(self.service.notifier(), &claims, State::Active);

        for claim in &claims {
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                // Unreachable while the loop owns the semaphore; the expiry
                // sweep recovers whatever was claimed but not started.
                warn!(task_id = %claim.task_id, "worker pool closed; task left to expire");
                break;
            };
            let service = Arc::clone(&self.service);
            let retry = self.retry;
            let claim = claim.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = with_retry(retry, "execute_claimed", || {
                    service.execute_claimed(&claim)
                })
                .await;
                if let Err(err) = result {
                    error!(
                        job_id = %claim.job_id,
                        task_id = %claim.task_id,
                        error = %err,
                        "task execution failed; failing job"
                    );
                    let failed = with_retry(retry, "fail_job", || {
                        service.fail_job(&claim.job_id, Some(&claim.task_id))
                    })
                    .await;
                    if let Err(err) = failed {
                        error!(job_id = %claim.job_id, error = %err, "could not fail job");
                    }
                }
            });
        }
        Ok(claims)
    }
}

#[async_trait]
impl<S, N> LoopBody for TaskLoop<S, N>
where
    S: JobStore + 'static,
    N: StateNotifier + 'static,
{
    fn name(&self) -> &'static str {
        "task-loop"
    }

    async fn on_start(&self) -> EngineResult<()> {
        self.expiry
            .sweep(self.service.store(), self.service.notifier())
            .await?;
        Ok(())
    }

    async fn iterate(&self) -> EngineResult<bool> {
        self.expiry
            .sweep_if_due(self.service.store(), self.service.notifier())
            .await?;
        Ok(!self.dispatch().await?.is_empty())
    }
}
