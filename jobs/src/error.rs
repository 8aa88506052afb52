use oracle_core::ChainCommunicationError;
use pipeline::PipelineError;
use sea_orm::DbErr;

/// Result type of the jobs crate
pub type JobResult<T> = Result<T, JobError>;

/// Errors of managing jobs and triggering their runs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job spec or request is invalid and will never succeed
    #[error("validation error: {0}")]
    Validation(String),
    /// Nothing matches the request
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller presented a missing or wrong token
    #[error("unauthorized")]
    Unauthorized,
    /// The job is being deleted, or could not be because runs are still
    /// executing
    #[error("job is draining: {0}")]
    Draining(String),
    /// Failure of the pipeline runner
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Database failure
    #[error(transparent)]
    Db(#[from] DbErr),
    /// The chain could not be queried
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
}

impl JobError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the error was caused by the request rather than the node.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Pipeline(e) => e.is_validation(),
            _ => false,
        }
    }

    /// Whether the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Pipeline(PipelineError::NotFound(_))
        )
    }
}
