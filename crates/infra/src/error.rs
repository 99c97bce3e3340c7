//! Engine-level error type.

use dagops_core::DomainError;

use crate::processor::ProcessorError;
use crate::store::StoreError;

/// Error returned by the processing service, the job service and the loops.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Worth another attempt in a fresh unit of work.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Domain(_) => false,
            EngineError::Store(err) => err.is_transient(),
            EngineError::Processor(_) => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Domain(err) if err.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Domain(err) if err.is_conflict())
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        EngineError::Domain(err)
    }
}

/// Domain refusals and unknown jobs are lifted out of the store error so
/// callers match on one place.
impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(err) => EngineError::Domain(err),
            StoreError::NotFound(job_id) => EngineError::Domain(DomainError::not_found("job", job_id)),
            other => EngineError::Store(other),
        }
    }
}
