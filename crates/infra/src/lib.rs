//! Engine layer: storage, task processing, the job service and the loops
//! that drive jobs to completion.

pub mod config;
pub mod error;
mod notify;
pub mod processing;
pub mod processor;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use processing::TaskProcessingService;
pub use processor::{
    NoopProcessor, ProcessorError, ProcessorRegistry, TaskOutcome, TaskProcessor, TaskProcessors,
};
pub use retry::{RetryPolicy, with_retry};
pub use scheduler::{Engine, EventLoop, EventLoopStatus};
pub use service::JobService;
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError, TaskRef};
