use chrono::{DateTime, Utc};
use oracle_core::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an [`EthTx`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EthTxState {
    /// Queued, no nonce yet
    Unstarted,
    /// Nonce assigned and first attempt written, not yet accepted by the node
    InProgress,
    /// Accepted by the node, waiting for confirmations
    Unconfirmed,
    /// Mined with enough confirmations
    Confirmed,
    /// Permanently failed
    FatalError,
}

/// Lifecycle of an [`EthTxAttempt`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptState {
    /// Signed but not yet accepted by the node
    InProgress,
    /// Accepted by the node
    Broadcast,
    /// The attempt that got mined and confirmed
    Confirmed,
}

/// A transaction to enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTx {
    /// Sending key
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Calldata
    pub payload: Bytes,
    /// Value in wei
    #[serde(default)]
    pub value: U256,
    /// Gas limit, the configured default when absent
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// Pipeline task waiting on the outcome
    #[serde(default)]
    pub task_run_id: Option<Uuid>,
    /// Overrides the configured confirmation count
    #[serde(default)]
    pub min_confirmations: Option<u64>,
}

/// An outbound transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTx {
    /// Row id
    pub id: i64,
    /// Sending key
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Calldata
    pub payload: Bytes,
    /// Value in wei
    pub value: U256,
    /// Gas limit
    pub gas_limit: u64,
    /// Nonce, set once the tx leaves `unstarted`
    pub nonce: Option<u64>,
    /// Current state
    pub state: EthTxState,
    /// Why the tx failed, for `fatal_error`. On a tx still being mined,
    /// why its task run gave up on it.
    pub error: Option<String>,
    /// Pipeline task waiting on the outcome
    pub task_run_id: Option<Uuid>,
    /// Confirmation count override
    pub min_confirmations: Option<u64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// First successful broadcast
    pub broadcast_at: Option<DateTime<Utc>>,
}

impl EthTx {
    /// Whether the task run that created the tx gave up on it after it was
    /// broadcast. Such a tx is still mined to keep its nonce, but its
    /// outcome is not reported.
    pub fn abandoned(&self) -> bool {
        self.error.is_some()
            && matches!(
                self.state,
                EthTxState::InProgress | EthTxState::Unconfirmed | EthTxState::Confirmed
            )
    }
}

/// One signed version of an [`EthTx`]. Attempts differ only in gas price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTxAttempt {
    /// Row id
    pub id: i64,
    /// Owning tx
    pub eth_tx_id: i64,
    /// Hash of the signed bytes
    pub hash: H256,
    /// Legacy gas price
    pub gas_price: U256,
    /// Signed RLP
    pub signed_raw_tx: Bytes,
    /// Current state
    pub state: AttemptState,
    /// Head number seen first after the broadcast
    pub broadcast_before_block_number: Option<u64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time the node accepted these bytes
    pub broadcast_at: Option<DateTime<Utc>>,
}

/// A signed attempt about to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    /// Hash of the signed bytes
    pub hash: H256,
    /// Legacy gas price
    pub gas_price: U256,
    /// Signed RLP
    pub signed_raw_tx: Bytes,
}

/// A receipt observed for an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReceipt {
    /// Attempt hash
    pub tx_hash: H256,
    /// Containing block
    pub block_hash: H256,
    /// Containing block number
    pub block_number: u64,
    /// Index in the block
    pub tx_index: u64,
    /// Execution status
    pub status: Option<bool>,
}

/// Nonce bookkeeping of a sending key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyState {
    /// Sending address
    pub address: Address,
    /// Nonce the next unstarted tx gets
    pub next_nonce: u64,
    /// Disabled keys broadcast nothing
    pub disabled: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Outcome delivered to the pipeline task waiting on a tx.
pub type TxOutcome = Result<H256, String>;
