use serde::{Deserialize, Serialize};

use crate::{Address, Bytes, H256};

/// An event log as delivered by the chain client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics, topic 0 being the event signature
    pub topics: Vec<H256>,
    /// Non-indexed data
    pub data: Bytes,
    /// Hash of the containing block
    pub block_hash: H256,
    /// Number of the containing block
    pub block_number: u64,
    /// Hash of the emitting transaction
    pub tx_hash: H256,
    /// Index of the emitting transaction in the block
    pub tx_index: u64,
    /// Index of the log in the block
    pub log_index: u64,
    /// Set when the log was removed by a reorg
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    /// The event signature topic.
    pub fn topic0(&self) -> Option<H256> {
        self.topics.first().copied()
    }
}

/// Selects logs by emitting address and event signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Match any of these addresses; empty matches all
    pub addresses: Vec<Address>,
    /// Match any of these topic 0 values; empty matches all
    pub topic0: Vec<H256>,
    /// First block to include
    pub from_block: Option<u64>,
    /// Last block to include
    pub to_block: Option<u64>,
}

impl LogFilter {
    /// Filter on a single contract and event signature set
    pub fn new(address: Address, topic0: Vec<H256>) -> Self {
        Self {
            addresses: vec![address],
            topic0,
            from_block: None,
            to_block: None,
        }
    }

    /// Sets the first block.
    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    /// Whether a log passes this filter.
    pub fn matches(&self, log: &Log) -> bool {
        let address_ok = self.addresses.is_empty() || self.addresses.contains(&log.address);
        let topic_ok = self.topic0.is_empty()
            || log
                .topic0()
                .map(|t| self.topic0.contains(&t))
                .unwrap_or(false);
        let from_ok = self.from_block.map_or(true, |b| log.block_number >= b);
        let to_ok = self.to_block.map_or(true, |b| log.block_number <= b);
        address_ok && topic_ok && from_ok && to_ok
    }
}
