use chrono::{TimeZone, Utc};
use ethers::{
    providers::{ProviderError, RpcError},
    types::{Block, Filter, Log as EthersLog, TransactionReceipt, ValueOrArray, U64},
};
use oracle_core::{ChainCommunicationError, Head, Log, LogFilter, TxReceipt, H256};

/// Converts a block header into a head. Pending blocks have no hash or
/// number and are skipped.
pub(crate) fn block_to_head<T>(block: &Block<T>) -> Option<Head> {
    let hash = block.hash?;
    let number = block.number?.as_u64();
    let timestamp = Utc
        .timestamp_opt(block.timestamp.low_u64() as i64, 0)
        .single()
        .unwrap_or_default();
    let mut head = Head::new(hash, number, block.parent_hash, timestamp);
    // present on rollups that report the L1 block they were derived from
    head.l1_block_number = block
        .other
        .get_deserialized::<U64>("l1BlockNumber")
        .and_then(Result::ok)
        .map(|n| n.as_u64());
    Some(head)
}

pub(crate) fn to_ethers_filter(filter: &LogFilter) -> Filter {
    let mut out = Filter::new();
    if !filter.addresses.is_empty() {
        out = out.address(ValueOrArray::Array(filter.addresses.clone()));
    }
    if !filter.topic0.is_empty() {
        out = out.topic0(ValueOrArray::Array(
            filter.topic0.iter().copied().map(Some).collect(),
        ));
    }
    if let Some(from) = filter.from_block {
        out = out.from_block(from);
    }
    if let Some(to) = filter.to_block {
        out = out.to_block(to);
    }
    out
}

pub(crate) fn from_ethers_log(log: EthersLog) -> Option<Log> {
    Some(Log {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_hash: log.block_hash?,
        block_number: log.block_number?.as_u64(),
        tx_hash: log.transaction_hash.unwrap_or_else(H256::zero),
        tx_index: log.transaction_index.map(|i| i.as_u64()).unwrap_or_default(),
        log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
        removed: log.removed.unwrap_or(false),
    })
}

pub(crate) fn from_ethers_receipt(receipt: TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_hash: receipt.block_hash,
        block_number: receipt.block_number.map(|n| n.as_u64()),
        tx_index: receipt.transaction_index.as_u64(),
        status: receipt.status.map(|s| s.as_u64() == 1),
        gas_used: receipt.gas_used.map(|g| g.low_u64()),
    }
}

/// Maps a provider error, keeping the JSON-RPC code and message so callers
/// can classify it.
pub(crate) fn map_provider_error(err: ProviderError) -> ChainCommunicationError {
    if let Some(resp) = err.as_error_response() {
        return ChainCommunicationError::rpc(Some(resp.code), resp.message.clone());
    }
    match err {
        ProviderError::SerdeJson(e) => ChainCommunicationError::Decode(e.to_string()),
        ProviderError::HexError(e) => ChainCommunicationError::Decode(e.to_string()),
        other => ChainCommunicationError::Transport(other.to_string()),
    }
}
