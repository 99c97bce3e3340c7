//! Task processors and their registry.
//!
//! A processor performs the actual work of a task (talking to a network
//! element, running a script, ...) and reports a [`TaskOutcome`]. Processors
//! are grouped by job application and job type; the registry is populated at
//! startup and read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dagops_core::{JobApplication, JobType, State, TaskType};
use dagops_jobs::Task;

/// Result of running a task processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub state: State,
    pub message: Option<String>,
}

impl TaskOutcome {
    pub fn completed() -> Self {
        Self {
            state: State::Completed,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: State::Failed,
            message: Some(message.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            state: State::Rejected,
            message: Some(message.into()),
        }
    }

    /// Work was started elsewhere; the task stays ACTIVE until an outcome is
    /// reported back.
    pub fn pending() -> Self {
        Self {
            state: State::Active,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether a processor may legitimately report this state.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self.state,
            State::Completed | State::Failed | State::Rejected | State::Active
        )
    }
}

/// A processor could not run at all (as opposed to reporting a failed task).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("processor failed: {0}")]
    Failed(String),

    #[error("processor panicked: {0}")]
    Panicked(String),
}

/// Executes one kind of task.
///
/// Processors run on the blocking thread pool and may be invoked more than
/// once for the same task after a crash, so they should be idempotent.
pub trait TaskProcessor: Send + Sync {
    fn execute(&self, task: &Task) -> Result<TaskOutcome, ProcessorError>;
}

impl<F> TaskProcessor for F
where
    F: Fn(&Task) -> TaskOutcome + Send + Sync,
{
    fn execute(&self, task: &Task) -> Result<TaskOutcome, ProcessorError> {
        Ok(self(task))
    }
}

/// Completes every task immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProcessor;

impl TaskProcessor for NoopProcessor {
    fn execute(&self, _task: &Task) -> Result<TaskOutcome, ProcessorError> {
        Ok(TaskOutcome::completed())
    }
}

/// Processors for one job application, optionally narrowed to a job type.
#[derive(Clone)]
pub struct TaskProcessors {
    application: JobApplication,
    job_type: Option<JobType>,
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
    default: Option<Arc<dyn TaskProcessor>>,
}

impl TaskProcessors {
    pub fn new(application: impl Into<JobApplication>) -> Self {
        Self {
            application: application.into(),
            job_type: None,
            processors: HashMap::new(),
            default: None,
        }
    }

    pub fn for_job_type(mut self, job_type: impl Into<JobType>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_processor(
        mut self,
        task_type: impl Into<TaskType>,
        processor: impl TaskProcessor + 'static,
    ) -> Self {
        self.processors.insert(task_type.into(), Arc::new(processor));
        self
    }

    /// Used for task types without a dedicated processor.
    pub fn with_default(mut self, processor: impl TaskProcessor + 'static) -> Self {
        self.default = Some(Arc::new(processor));
        self
    }

    fn matches(&self, application: &JobApplication, job_type: &JobType) -> bool {
        &self.application == application
            && self.job_type.as_ref().is_none_or(|t| t == job_type)
    }

    fn processor(&self, task_type: &TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors
            .get(task_type)
            .or(self.default.as_ref())
            .cloned()
    }
}

impl fmt::Debug for TaskProcessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut task_types: Vec<&str> = self.processors.keys().map(|t| t.as_str()).collect();
        task_types.sort_unstable();
        f.debug_struct("TaskProcessors")
            .field("application", &self.application)
            .field("job_type", &self.job_type)
            .field("task_types", &task_types)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Ordered list of processor groups.
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    groups: Vec<TaskProcessors>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, group: TaskProcessors) -> Self {
        self.groups.push(group);
        self
    }

    /// The first group matching the job decides. `None` means the task
    /// needs no processing and completes as is.
    pub fn resolve(
        &self,
        application: &JobApplication,
        job_type: &JobType,
        task_type: &TaskType,
    ) -> Option<Arc<dyn TaskProcessor>> {
        self.groups
            .iter()
            .find(|group| group.matches(application, job_type))
            .and_then(|group| group.processor(task_type))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
