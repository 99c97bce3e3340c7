use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{ElementId, JobId, State, TaskId, TaskName, TaskType};

/// A node in a job's task graph.
///
/// Tasks never hold references to their neighbours; successors and
/// predecessors are resolved through the owning [`crate::Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    job_id: JobId,
    task_type: TaskType,
    name: TaskName,
    state: State,
    element: Option<ElementId>,
    parameters: serde_json::Value,
    canary: bool,
    modified_at: DateTime<Utc>,
}

impl Task {
    /// Create a NEW task for `job_id`.
    pub fn new(job_id: JobId, id: TaskId, task_type: TaskType, name: TaskName) -> Self {
        Self {
            id,
            job_id,
            task_type,
            name,
            state: State::New,
            element: None,
            parameters: serde_json::Value::Null,
            canary: false,
            modified_at: Utc::now(),
        }
    }

    pub fn with_element(mut self, element: ElementId) -> Self {
        self.element = Some(element);
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_canary(mut self, canary: bool) -> Self {
        self.canary = canary;
        self
    }

    /// Restore persisted state when rehydrating a task from storage.
    pub fn restore_state(mut self, state: State, modified_at: DateTime<Utc>) -> Self {
        self.state = state;
        self.modified_at = modified_at;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn element(&self) -> Option<&ElementId> {
        self.element.as_ref()
    }

    pub fn parameters(&self) -> &serde_json::Value {
        &self.parameters
    }

    pub fn is_canary(&self) -> bool {
        self.canary
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_succeeded(&self) -> bool {
        self.state.is_succeeded()
    }

    pub fn is_resumable(&self) -> bool {
        self.state.is_resumable()
    }

    pub(crate) fn set_state(&mut self, state: State, at: DateTime<Utc>) {
        self.state = state;
        self.modified_at = at;
    }

    pub(crate) fn set_parameters(&mut self, parameters: serde_json::Value) {
        self.parameters = parameters;
    }
}
