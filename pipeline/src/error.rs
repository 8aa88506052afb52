use sea_orm::DbErr;

/// Result type of the pipeline crate
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors of parsing, storing and running pipelines. Task failures are not
/// errors here; they are recorded on the task run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The pipeline source does not parse
    #[error("line {line}: {msg}")]
    Parse {
        /// 1-based line of the offending token
        line: usize,
        /// What went wrong
        msg: String,
    },
    /// The pipeline parses but is not a valid DAG
    #[error("invalid pipeline: {0}")]
    InvalidDag(String),
    /// The request is invalid and will never succeed
    #[error("validation error: {0}")]
    Validation(String),
    /// Nothing matches the request
    #[error("not found: {0}")]
    NotFound(String),
    /// Database failure
    #[error(transparent)]
    Db(#[from] DbErr),
}

impl PipelineError {
    pub(crate) fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            line,
            msg: msg.into(),
        }
    }

    /// Whether the error was caused by the request rather than the node.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::InvalidDag(_) | Self::Validation(_)
        )
    }
}
