use serde::{Deserialize, Serialize};

use crate::{Address, Bytes, H256, U256};

/// A legacy transaction ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    /// Sender nonce
    pub nonce: u64,
    /// Recipient
    pub to: Address,
    /// Value in wei
    pub value: U256,
    /// Calldata
    pub data: Bytes,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas price in wei
    pub gas_price: U256,
}

/// Output of the key store: the raw signed bytes and their hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    /// Keccak hash of `raw`
    pub hash: H256,
    /// RLP of the signed transaction
    pub raw: Bytes,
}

/// A read-only contract call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallRequest {
    /// Optional caller
    pub from: Option<Address>,
    /// Contract address
    pub to: Address,
    /// Calldata
    pub data: Bytes,
    /// Optional gas allowance
    pub gas: Option<u64>,
}
