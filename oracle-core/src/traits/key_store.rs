use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;

use crate::{Address, ChainResult, SignedTx, UnsignedTx};

/// Signing capabilities keyed by address.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait KeyStore: Send + Sync + Debug {
    /// Addresses the node may send from
    async fn sending_keys(&self) -> ChainResult<Vec<Address>>;

    /// Signs `tx` with the key for `from`
    async fn sign_tx(&self, from: Address, tx: &UnsignedTx, chain_id: u64)
        -> ChainResult<SignedTx>;
}
