use oracle_core::ChainCommunicationError;
use sea_orm::DbErr;
use thiserror::Error;

/// Result alias for the head tracker
pub type HeadTrackerResult<T> = Result<T, HeadTrackerError>;

/// Errors raised while following the chain.
#[derive(Debug, Error)]
pub enum HeadTrackerError {
    /// More canonical blocks were rewritten than the finality depth allows
    #[error("head divergence: {replaced} canonical blocks replaced, finality depth is {finality_depth}")]
    HeadDivergence {
        /// Number of previously canonical blocks the new chain replaced
        replaced: u64,
        /// Configured finality depth
        finality_depth: u64,
    },
    /// The head subscription could not be re-established
    #[error("blockchain unavailable: {0}")]
    BlockchainUnavailable(String),
    /// Database failure
    #[error(transparent)]
    Db(#[from] DbErr),
    /// Chain client failure
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
}

impl HeadTrackerError {
    /// Whether the node must shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HeadDivergence { .. })
    }
}
