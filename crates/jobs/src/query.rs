use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dagops_core::{ElementGroupId, State};

use crate::view::JobSettings;

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    /// Case-insensitive substring of the job name or id.
    pub filter: Option<String>,
    /// Only jobs that are committed and not yet terminated.
    #[serde(default)]
    pub running_only: bool,
    pub scheduled_after: Option<DateTime<Utc>>,
    pub scheduled_before: Option<DateTime<Utc>>,
    /// Only jobs submitted for this element group.
    #[serde(default)]
    pub group_id: Option<ElementGroupId>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_running_only(mut self, running_only: bool) -> Self {
        self.running_only = running_only;
        self
    }

    pub fn with_scheduled_after(mut self, after: DateTime<Utc>) -> Self {
        self.scheduled_after = Some(after);
        self
    }

    pub fn with_scheduled_before(mut self, before: DateTime<Utc>) -> Self {
        self.scheduled_before = Some(before);
        self
    }

    pub fn with_group(mut self, group_id: ElementGroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// In-process evaluation; SQL stores translate the same rules into a
    /// WHERE clause.
    pub fn matches(&self, job: &JobSettings) -> bool {
        if let Some(filter) = self.filter.as_deref().map(str::to_lowercase) {
            let name = job.name.as_str().to_lowercase();
            let id = job.job_id.as_str().to_lowercase();
            if !name.contains(&filter) && !id.contains(&filter) {
                return false;
            }
        }
        if self.running_only && (job.state.is_terminal() || job.state == State::New) {
            return false;
        }
        if self.group_id.is_some() && job.group_id != self.group_id {
            return false;
        }
        let scheduled = job.schedule.scheduled;
        if let Some(after) = self.scheduled_after {
            if scheduled.is_none_or(|at| at < after) {
                return false;
            }
        }
        if let Some(before) = self.scheduled_before {
            if scheduled.is_none_or(|at| at > before) {
                return false;
            }
        }
        true
    }
}
