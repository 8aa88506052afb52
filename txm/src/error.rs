use oracle_core::{Address, ChainCommunicationError, U256};
use sea_orm::DbErr;

/// Result type of the transaction manager
pub type TxmResult<T> = Result<T, TxmError>;

/// Errors of the transaction manager.
#[derive(Debug, thiserror::Error)]
pub enum TxmError {
    /// The address already holds the maximum number of unstarted txs
    #[error("queue full: {address:?} already has {limit} unstarted transactions")]
    QueueFull {
        /// Sending address
        address: Address,
        /// Configured maximum
        limit: u64,
    },
    /// The request is invalid and will never succeed
    #[error("validation error: {0}")]
    Validation(String),
    /// Nothing matches the request
    #[error("not found: {0}")]
    NotFound(String),
    /// The newest attempt is already priced at the configured cap
    #[error("gas price {price} already at cap {cap}")]
    GasCapReached {
        /// Price of the newest attempt
        price: U256,
        /// Configured maximum gas price
        cap: U256,
    },
    /// The sending key cannot pay for the transaction
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// The transaction was mined but execution reverted
    #[error("transaction reverted")]
    Reverted,
    /// The node rejected the transaction for good
    #[error("fatal send error: {0}")]
    FatalSend(String),
    /// The nonce stored for the address moved under us
    #[error("nonce for {address:?} is {stored}, expected {expected}")]
    NonceMismatch {
        /// Sending address
        address: Address,
        /// Nonce the caller worked with
        expected: u64,
        /// Nonce found in the store
        stored: u64,
    },
    /// Database failure
    #[error(transparent)]
    Db(#[from] DbErr),
    /// Chain or key store failure
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
}
