use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;
use tokio::sync::mpsc;

use crate::{
    Address, Bytes, CallRequest, ChainResult, Head, Log, LogFilter, TxReceipt, H256, U256,
};

/// A stream of items pushed by the chain client.
///
/// The stream ends (`recv` returns `None`) when the underlying connection is
/// lost; owners are expected to subscribe again.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Wraps a receiving half fed by the client
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Next item, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Creates a subscription and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

/// Whether the node can currently follow the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChainHealth {
    /// Head subscription is live
    #[default]
    Healthy,
    /// Head subscription could not be re-established within its retry budget
    Unavailable,
}

/// RPC facade over an EVM node.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait ChainClient: Send + Sync + Debug {
    /// The EIP-155 chain id used when signing
    fn chain_id(&self) -> u64;

    /// Latest block number
    async fn block_number(&self) -> ChainResult<u64>;

    /// Head at `number`, or the latest head when `None`
    async fn head_by_number(&self, number: Option<u64>) -> ChainResult<Option<Head>>;

    /// Head with the given hash
    async fn head_by_hash(&self, hash: H256) -> ChainResult<Option<Head>>;

    /// Receipt for a transaction hash; `None` if unknown or not mined
    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>>;

    /// Submits signed bytes and returns the transaction hash
    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;

    /// Nonce of `address` counting pending transactions
    async fn pending_nonce_at(&self, address: Address) -> ChainResult<u64>;

    /// Stream of new heads
    async fn subscribe_new_heads(&self) -> ChainResult<Subscription<Head>>;

    /// Stream of logs matching `filter`
    async fn subscribe_logs(&self, filter: LogFilter) -> ChainResult<Subscription<Log>>;

    /// Historical logs matching `filter`
    async fn filter_logs(&self, filter: LogFilter) -> ChainResult<Vec<Log>>;

    /// Balance of `address` at `block` or latest
    async fn balance_at(&self, address: Address, block: Option<u64>) -> ChainResult<U256>;

    /// Executes a read-only call at `block` or latest
    async fn call_contract(&self, call: CallRequest, block: Option<u64>) -> ChainResult<Bytes>;
}
