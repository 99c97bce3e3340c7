use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dagops_core::{DomainError, DomainResult, JobId, State, TaskId};
use dagops_jobs::{Job, JobQuery, JobSettings};

use super::r#trait::{JobStore, StoreError, TaskRef};

/// In-memory job store.
///
/// Intended for tests/dev. Every job sits behind its own mutex, which plays
/// the role of the row lock: [`JobStore::update_job`] blocks on it, the claim
/// path only `try_lock`s and skips jobs that are busy.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Arc<Mutex<Job>>>>,
    task_index: RwLock<HashMap<TaskId, JobId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn entry(&self, job_id: &JobId) -> Result<Option<Arc<Mutex<Job>>>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(job_id).cloned())
    }

    fn entries(&self) -> Result<Vec<Arc<Mutex<Job>>>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.values().cloned().collect())
    }

    /// Apply `f` to every job in id order, holding each job's lock in turn.
    fn for_each_job<T>(&self, mut f: impl FnMut(&mut Job) -> Vec<T>) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in self.entries()? {
            let mut job = lock(&entry)?;
            out.extend(f(&mut job));
        }
        Ok(out)
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

fn lock(entry: &Mutex<Job>) -> Result<MutexGuard<'_, Job>, StoreError> {
    entry.lock().map_err(|_| poisoned())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut index = self.task_index.write().map_err(|_| poisoned())?;

        if jobs.contains_key(job.id()) {
            return Err(StoreError::AlreadyExists(job.id().clone()));
        }
        if let Some(task) = job.tasks().find(|t| index.contains_key(t.id())) {
            return Err(StoreError::Domain(DomainError::conflict(format!(
                "task id {} is already used by another job",
                task.id()
            ))));
        }

        for task in job.tasks() {
            index.insert(task.id().clone(), job.id().clone());
        }
        jobs.insert(job.id().clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        match self.entry(job_id)? {
            Some(entry) => Ok(Some(lock(&entry)?.clone())),
            None => Ok(None),
        }
    }

    async fn update_job<F, R>(&self, job_id: &JobId, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<R> + Send,
        R: Send,
    {
        let entry = self
            .entry(job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        let mut guard = lock(&entry)?;

        // Mutate a copy so a failing closure leaves the stored job untouched.
        let mut working = guard.clone();
        let result = f(&mut working)?;
        *guard = working;
        Ok(result)
    }

    async fn remove_job(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut index = self.task_index.write().map_err(|_| poisoned())?;
        let Some(entry) = jobs.get(job_id).cloned() else {
            return Ok(false);
        };
        // Lock order is map, then job. No path takes the map lock while
        // holding a job lock.
        let job = lock(&entry)?;
        job.ensure_removable()?;
        jobs.remove(job_id);
        drop(job);
        index.retain(|_, owner| owner != job_id);
        Ok(true)
    }

    async fn find_job_by_task(&self, task_id: &TaskId) -> Result<Option<JobId>, StoreError> {
        let index = self.task_index.read().map_err(|_| poisoned())?;
        Ok(index.get(task_id).cloned())
    }

    async fn find_jobs(
        &self,
        query: &JobQuery,
        limit: usize,
    ) -> Result<Vec<JobSettings>, StoreError> {
        let mut found = Vec::new();
        for entry in self.entries()? {
            let settings = JobSettings::from(&*lock(&entry)?);
            if query.matches(&settings) {
                found.push(settings);
            }
        }
        found.sort_by(|a, b| b.schedule.scheduled.cmp(&a.schedule.scheduled));
        found.truncate(limit);
        Ok(found)
    }

    async fn start_scheduled_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        self.for_each_job(|job| {
            if job.start_if_due(now) {
                vec![job.id().clone()]
            } else {
                Vec::new()
            }
        })
    }

    async fn mark_ready_tasks(&self) -> Result<Vec<TaskRef>, StoreError> {
        self.for_each_job(|job| {
            let job_id = job.id().clone();
            job.mark_eligible_tasks_ready()
                .into_iter()
                .map(|task_id| TaskRef::new(job_id.clone(), task_id))
                .collect()
        })
    }

    async fn mark_failed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        self.for_each_job(|job| {
            let running = matches!(job.state(), State::Active | State::Confirm);
            if running && job.has_task_in(|s| s.is_failure()) {
                job.failed();
                vec![job.id().clone()]
            } else {
                Vec::new()
            }
        })
    }

    async fn mark_confirm_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        self.for_each_job(|job| {
            if job.is_running() && job.has_task_in(|s| s == State::Confirm) {
                job.await_confirmation();
                vec![job.id().clone()]
            } else {
                Vec::new()
            }
        })
    }

    async fn mark_completed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        self.for_each_job(|job| {
            let running = matches!(job.state(), State::Active | State::Confirm);
            if running && job.task_count() > 0 && job.completed() {
                vec![job.id().clone()]
            } else {
                Vec::new()
            }
        })
    }

    async fn claim_ready_tasks(&self, limit: usize) -> Result<Vec<TaskRef>, StoreError> {
        let mut claimed = Vec::new();
        for entry in self.entries()? {
            if claimed.len() >= limit {
                break;
            }
            let mut job = match entry.try_lock() {
                Ok(job) => job,
                // Held by another claimant or mutation: skip it.
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => return Err(poisoned()),
            };
            let job_id = job.id().clone();
            claimed.extend(
                job.claim_ready_tasks(limit - claimed.len())
                    .into_iter()
                    .map(|task_id| TaskRef::new(job_id.clone(), task_id)),
            );
        }
        Ok(claimed)
    }

    async fn expire_active_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError> {
        self.for_each_job(|job| {
            let job_id = job.id().clone();
            job.expire_tasks(cutoff)
                .into_iter()
                .map(|task_id| TaskRef::new(job_id.clone(), task_id))
                .collect()
        })
    }
}
