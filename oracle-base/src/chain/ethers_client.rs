use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
    providers::{Middleware, Provider, ProviderError, Ws},
    types::{BlockId, BlockNumber, NameOrAddress, TransactionRequest},
};
use eyre::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{info, info_span, instrument, warn, Instrument};

use oracle_core::{
    Address, Bytes, CallRequest, ChainClient, ChainCommunicationError, ChainResult, Head, Log,
    LogFilter, Subscription, TxReceipt, H256, U256,
};

use super::conversions::*;
use crate::settings::ChainConf;

const SUBSCRIPTION_BUFFER: usize = 256;

/// Chain client backed by an ethers websocket provider.
#[derive(Debug, Clone)]
pub struct EthersChainClient {
    provider: Arc<Provider<Ws>>,
    chain_id: u64,
    request_timeout: Duration,
}

impl EthersChainClient {
    /// Connects to the websocket endpoint and checks the chain id against
    /// the configured one.
    #[instrument(skip_all, fields(url = %conf.ws_url))]
    pub async fn connect(conf: &ChainConf) -> Result<Self> {
        let ws = Ws::connect_with_reconnects(conf.ws_url.as_str(), conf.ws_reconnects)
            .await
            .context("Failed to connect to websocket endpoint")?;
        let provider = Provider::new(ws);
        let chain_id = provider
            .get_chainid()
            .await
            .context("Failed to fetch chain id")?
            .as_u64();
        if let Some(expected) = conf.chain_id {
            if expected != chain_id {
                eyre::bail!("Node reports chain id {chain_id}, configured {expected}");
            }
        }
        info!(chain_id, "Connected to chain");
        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
            request_timeout: conf.request_timeout,
        })
    }

    async fn timed<T, F>(&self, fut: F) -> ChainResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(res) => res.map_err(map_provider_error),
            Err(_) => Err(ChainCommunicationError::Timeout),
        }
    }

    fn block_id(block: Option<u64>) -> BlockId {
        match block {
            Some(n) => BlockNumber::Number(n.into()).into(),
            None => BlockNumber::Latest.into(),
        }
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.timed(self.provider.get_block_number()).await?.as_u64())
    }

    async fn head_by_number(&self, number: Option<u64>) -> ChainResult<Option<Head>> {
        let block = self
            .timed(self.provider.get_block(Self::block_id(number)))
            .await?;
        Ok(block.as_ref().and_then(block_to_head))
    }

    async fn head_by_hash(&self, hash: H256) -> ChainResult<Option<Head>> {
        let block = self.timed(self.provider.get_block(hash)).await?;
        Ok(block.as_ref().and_then(block_to_head))
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>> {
        let receipt = self
            .timed(self.provider.get_transaction_receipt(hash))
            .await?;
        Ok(receipt.map(from_ethers_receipt))
    }

    #[instrument(skip_all)]
    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        let pending = self
            .timed(self.provider.send_raw_transaction(raw))
            .await?;
        Ok(*pending)
    }

    async fn pending_nonce_at(&self, address: Address) -> ChainResult<u64> {
        let nonce = self
            .timed(
                self.provider
                    .get_transaction_count(address, Some(BlockNumber::Pending.into())),
            )
            .await?;
        Ok(nonce.low_u64())
    }

    async fn subscribe_new_heads(&self) -> ChainResult<Subscription<Head>> {
        let (sender, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let provider = self.provider.clone();
        tokio::spawn(
            async move {
                let mut stream = match provider.subscribe_blocks().await {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(map_provider_error(err)));
                        return;
                    }
                };
                while let Some(block) = stream.next().await {
                    let Some(head) = block_to_head(&block) else {
                        continue;
                    };
                    if sender.send(head).await.is_err() {
                        break;
                    }
                }
                warn!("New heads subscription ended");
            }
            .instrument(info_span!("NewHeadsSubscription")),
        );
        ready_rx
            .await
            .map_err(|_| ChainCommunicationError::SubscriptionClosed("new heads".into()))??;
        Ok(subscription)
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> ChainResult<Subscription<Log>> {
        let (sender, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let provider = self.provider.clone();
        let ethers_filter = to_ethers_filter(&filter);
        tokio::spawn(
            async move {
                let mut stream = match provider.subscribe_logs(&ethers_filter).await {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(map_provider_error(err)));
                        return;
                    }
                };
                while let Some(log) = stream.next().await {
                    let Some(log) = from_ethers_log(log) else {
                        continue;
                    };
                    if sender.send(log).await.is_err() {
                        break;
                    }
                }
                warn!("Log subscription ended");
            }
            .instrument(info_span!("LogSubscription")),
        );
        ready_rx
            .await
            .map_err(|_| ChainCommunicationError::SubscriptionClosed("logs".into()))??;
        Ok(subscription)
    }

    async fn filter_logs(&self, filter: LogFilter) -> ChainResult<Vec<Log>> {
        let logs = self
            .timed(self.provider.get_logs(&to_ethers_filter(&filter)))
            .await?;
        Ok(logs.into_iter().filter_map(from_ethers_log).collect())
    }

    async fn balance_at(&self, address: Address, block: Option<u64>) -> ChainResult<U256> {
        self.timed(self.provider.get_balance(address, Some(Self::block_id(block))))
            .await
    }

    async fn call_contract(&self, call: CallRequest, block: Option<u64>) -> ChainResult<Bytes> {
        let mut tx = TransactionRequest::new()
            .to(NameOrAddress::Address(call.to))
            .data(call.data);
        if let Some(from) = call.from {
            tx = tx.from(from);
        }
        if let Some(gas) = call.gas {
            tx = tx.gas(gas);
        }
        self.timed(
            self.provider
                .call(&tx.into(), Some(Self::block_id(block))),
        )
        .await
    }
}
