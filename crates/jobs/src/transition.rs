use serde::{Deserialize, Serialize};

use dagops_core::TaskId;

/// Directed edge `from -> to` in a job's task graph.
///
/// `seq` is the job-wide insertion sequence; successors are always reported
/// in ascending `seq` so rendered artifacts are reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: TaskId,
    pub to: TaskId,
    pub label: Option<String>,
    pub seq: u64,
}

impl Transition {
    pub fn new(from: TaskId, to: TaskId, label: Option<String>, seq: u64) -> Self {
        Self {
            from,
            to,
            label,
            seq,
        }
    }
}
