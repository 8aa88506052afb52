#![allow(non_snake_case)]

use async_trait::async_trait;
use mockall::mock;
use oracle_core::{
    Address, Bytes, CallRequest, ChainClient, ChainResult, Head, KeyStore, Log, LogFilter,
    SignedTx, Subscription, TxReceipt, UnsignedTx, H256, U256,
};

mock! {
    pub ChainClient {}

    impl std::fmt::Debug for ChainClient {
        fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
    }

    #[async_trait]
    impl ChainClient for ChainClient {
        fn chain_id(&self) -> u64;
        async fn block_number(&self) -> ChainResult<u64>;
        async fn head_by_number(&self, number: Option<u64>) -> ChainResult<Option<Head>>;
        async fn head_by_hash(&self, hash: H256) -> ChainResult<Option<Head>>;
        async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>>;
        async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;
        async fn pending_nonce_at(&self, address: Address) -> ChainResult<u64>;
        async fn subscribe_new_heads(&self) -> ChainResult<Subscription<Head>>;
        async fn subscribe_logs(&self, filter: LogFilter) -> ChainResult<Subscription<Log>>;
        async fn filter_logs(&self, filter: LogFilter) -> ChainResult<Vec<Log>>;
        async fn balance_at(&self, address: Address, block: Option<u64>) -> ChainResult<U256>;
        async fn call_contract(&self, call: CallRequest, block: Option<u64>) -> ChainResult<Bytes>;
    }
}

mock! {
    pub KeyStore {}

    impl std::fmt::Debug for KeyStore {
        fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
    }

    #[async_trait]
    impl KeyStore for KeyStore {
        async fn sending_keys(&self) -> ChainResult<Vec<Address>>;
        async fn sign_tx(&self, from: Address, tx: &UnsignedTx, chain_id: u64) -> ChainResult<SignedTx>;
    }
}
