//! Job graph model.
//!
//! A [`Job`] owns an arena of [`Task`]s keyed by id and the [`Transition`]
//! edges between them. All task state changes go through the job so the
//! graph invariants (single start task, eligibility, failure propagation)
//! are enforced in one place.

pub mod graph;
pub mod job;
pub mod query;
pub mod submission;
pub mod task;
pub mod transition;
pub mod view;

pub use graph::render_dot;
pub use job::{Job, StateDelta, StateSnapshot};
pub use query::JobQuery;
pub use submission::{JobSchedule, JobSettingsUpdate, JobSubmission, TaskSubmission, TransitionSubmission};
pub use task::Task;
pub use transition::Transition;
pub use view::{JobInfo, JobProgress, JobSettings, JobTaskInfo, TaskSummary};
