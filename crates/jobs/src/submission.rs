//! Inbound job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{
    DomainResult, ElementGroupId, ElementId, JobApplication, JobId, JobName, JobType, TaskId,
    TaskName, TaskType, UserName,
};

use crate::job::Job;
use crate::task::Task;

/// When a job may start and how it behaves around its suspend time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    /// Earliest start. Committing a job without one schedules it for "now".
    pub scheduled: Option<DateTime<Utc>>,
    pub suspend: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_resume: bool,
}

impl JobSchedule {
    pub fn at(scheduled: DateTime<Utc>) -> Self {
        Self {
            scheduled: Some(scheduled),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub task_name: TaskName,
    #[serde(default)]
    pub element: Option<ElementId>,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl TaskSubmission {
    pub fn new(task_id: TaskId, task_type: impl Into<TaskType>, task_name: impl Into<TaskName>) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            task_name: task_name.into(),
            element: None,
            canary: false,
            parameters: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSubmission {
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub label: Option<String>,
}

impl TransitionSubmission {
    pub fn new(from: TaskId, to: TaskId) -> Self {
        Self {
            from,
            to,
            label: None,
        }
    }
}

/// Complete definition of a job: header, schedule, tasks and transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub application: JobApplication,
    pub job_type: JobType,
    pub name: JobName,
    #[serde(default)]
    pub group_id: Option<ElementGroupId>,
    #[serde(default)]
    pub schedule: JobSchedule,
    pub tasks: Vec<TaskSubmission>,
    #[serde(default)]
    pub transitions: Vec<TransitionSubmission>,
}

impl JobSubmission {
    /// Build a NEW job graph and validate its shape.
    pub fn into_job(self, job_id: JobId, owner: Option<UserName>) -> DomainResult<Job> {
        let mut job = Job::new(job_id.clone(), self.application, self.job_type, self.name)
            .with_schedule(self.schedule);
        if let Some(owner) = owner {
            job = job.with_owner(owner);
        }
        if let Some(group_id) = self.group_id {
            job = job.with_group(group_id);
        }

        for submitted in self.tasks {
            let mut task = Task::new(
                job_id.clone(),
                submitted.task_id,
                submitted.task_type,
                submitted.task_name,
            )
            .with_parameters(submitted.parameters)
            .with_canary(submitted.canary);
            if let Some(element) = submitted.element {
                task = task.with_element(element);
            }
            job.add_task(task)?;
        }

        for transition in self.transitions {
            job.add_successor(&transition.from, &transition.to, transition.label)?;
        }

        job.validate()?;
        Ok(job)
    }
}

/// Mutable job settings. Everything else about a stored job is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettingsUpdate {
    pub name: JobName,
    #[serde(default)]
    pub schedule: JobSchedule,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagops_core::{DomainError, State};

    fn tid(id: &str) -> TaskId {
        id.parse().unwrap()
    }

    fn submission(transitions: Vec<TransitionSubmission>) -> JobSubmission {
        JobSubmission {
            application: "upgrade".into(),
            job_type: "rolling".into(),
            name: "upgrade leafs".into(),
            group_id: Some("pod-1".into()),
            schedule: JobSchedule::default(),
            tasks: vec![
                TaskSubmission::new(tid("start"), "fork", "start"),
                TaskSubmission {
                    canary: true,
                    element: Some("leaf-1".into()),
                    parameters: serde_json::json!({"image": "v2"}),
                    ..TaskSubmission::new(tid("leaf-1"), "upgrade", "upgrade leaf-1")
                },
            ],
            transitions,
        }
    }

    #[test]
    fn builds_a_new_job_with_all_task_attributes() {
        let job = submission(vec![TransitionSubmission::new(tid("start"), tid("leaf-1"))])
            .into_job("job-1".parse().unwrap(), Some("ops".into()))
            .unwrap();

        assert_eq!(job.state(), State::New);
        assert_eq!(job.start_task().unwrap().id(), &tid("start"));
        assert_eq!(job.group_id().map(|g| g.as_str()), Some("pod-1"));
        let leaf = job.task(&tid("leaf-1")).unwrap();
        assert!(leaf.is_canary());
        assert_eq!(leaf.element().map(|e| e.as_str()), Some("leaf-1"));
        assert_eq!(leaf.parameters()["image"], "v2");
        assert_eq!(leaf.state(), State::New);
    }

    #[test]
    fn rejects_disconnected_graphs() {
        let err = submission(vec![])
            .into_job("job-1".parse().unwrap(), None)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_transitions_to_unknown_tasks() {
        let err = submission(vec![TransitionSubmission::new(tid("start"), tid("ghost"))])
            .into_job("job-1".parse().unwrap(), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = serde_json::json!({
            "application": "upgrade",
            "job_type": "rolling",
            "name": "n",
            "tasks": [{"task_id": "start", "task_type": "noop", "task_name": "start"}]
        });
        let parsed: JobSubmission = serde_json::from_value(json).unwrap();
        assert!(parsed.transitions.is_empty());
        assert!(!parsed.tasks[0].canary);
        assert!(parsed.into_job("job-9".parse().unwrap(), None).is_ok());
    }
}
