//! `dagops-core`: shared vocabulary for the job engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job/task [`State`] machine and the domain error model.

pub mod error;
pub mod id;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{
    ElementGroupId, ElementId, JobApplication, JobId, JobName, JobType, TaskId, TaskName,
    TaskType, UserName,
};
pub use state::State;
