use serde::{Deserialize, Serialize};

use crate::H256;

/// The parts of a transaction receipt the node cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    /// Transaction hash
    pub tx_hash: H256,
    /// Containing block hash, absent while pending
    pub block_hash: Option<H256>,
    /// Containing block number, absent while pending
    pub block_number: Option<u64>,
    /// Index in the block
    pub tx_index: u64,
    /// Execution status, `Some(false)` when the transaction reverted
    pub status: Option<bool>,
    /// Gas used
    pub gas_used: Option<u64>,
}

impl TxReceipt {
    /// Whether the receipt places the transaction in a block.
    pub fn is_mined(&self) -> bool {
        self.block_number.is_some() && self.block_hash.is_some()
    }

    /// Whether execution reverted.
    pub fn reverted(&self) -> bool {
        self.status == Some(false)
    }

    /// Number of confirmations at `head_number`, counting the block itself as zero.
    pub fn confirmations_at(&self, head_number: u64) -> Option<u64> {
        self.block_number
            .filter(|n| *n <= head_number)
            .map(|n| head_number - n)
    }
}
