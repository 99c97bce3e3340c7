//! Job persistence.
//!
//! [`JobStore`] is the seam between the engine and storage. Two backends are
//! provided: [`InMemoryJobStore`] for tests and single-process use, and
//! [`PostgresJobStore`] for shared deployments where several workers claim
//! tasks from one database.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStore, StoreError, TaskRef};
