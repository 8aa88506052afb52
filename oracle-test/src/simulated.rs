use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::{
    signers::LocalWallet,
    types::transaction::eip2718::TypedTransaction,
    utils::{keccak256, rlp::Rlp},
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use oracle_base::LocalKeyStore;
use oracle_core::{
    Address, Bytes, CallRequest, ChainClient, ChainCommunicationError, ChainResult, Head, Log,
    LogFilter, Subscription, TxReceipt, H256, U256,
};

const GENESIS_TIMESTAMP: i64 = 1_700_000_000;
const BLOCK_TIME: i64 = 12;
const SUBSCRIPTION_BUFFER: usize = 1024;

/// A transaction accepted by [`SimulatedChain::send_raw_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTx {
    /// Transaction hash
    pub hash: H256,
    /// Recovered sender
    pub from: Address,
    /// Nonce
    pub nonce: u64,
    /// Legacy gas price
    pub gas_price: U256,
    /// Signed bytes
    pub raw: Bytes,
}

#[derive(Debug, Clone)]
struct Included {
    block_number: u64,
    from: Address,
    nonce: u64,
}

#[derive(Debug, Default)]
struct State {
    canonical: Vec<Head>,
    all_heads: HashMap<H256, Head>,
    fork_counter: u64,
    mempool: Vec<SentTx>,
    sent: Vec<SentTx>,
    receipts: HashMap<H256, TxReceipt>,
    included: HashMap<H256, Included>,
    account_nonces: HashMap<Address, u64>,
    withhold_receipts: bool,
    requeue_reorged: bool,
    send_errors: VecDeque<ChainCommunicationError>,
    subscriptions_failing: bool,
    head_subscribers: Vec<mpsc::Sender<Head>>,
    log_subscribers: Vec<(LogFilter, mpsc::Sender<Log>)>,
    logs: Vec<Log>,
    balances: HashMap<Address, U256>,
    call_results: HashMap<Address, Bytes>,
}

/// An in-memory EVM chain driven explicitly by tests.
///
/// Blocks are only produced by [`SimulatedChain::mine_block`] and friends.
/// Mining includes, per sender, the best priced pending transaction for the
/// next nonce until no more fit. Subscribers receive every new canonical
/// head.
#[derive(Debug)]
pub struct SimulatedChain {
    chain_id: u64,
    state: Mutex<State>,
    sends_stalled: watch::Sender<bool>,
}

fn block_hash(number: u64, fork: u64) -> H256 {
    let mut preimage = [0u8; 16];
    preimage[..8].copy_from_slice(&number.to_be_bytes());
    preimage[8..].copy_from_slice(&fork.to_be_bytes());
    H256::from(keccak256(preimage))
}

fn make_head(number: u64, parent_hash: H256, fork: u64) -> Head {
    let timestamp = Utc
        .timestamp_opt(GENESIS_TIMESTAMP + number as i64 * BLOCK_TIME, 0)
        .single()
        .unwrap_or_default();
    Head::new(block_hash(number, fork), number, parent_hash, timestamp)
}

fn rpc_err(msg: &str) -> ChainCommunicationError {
    ChainCommunicationError::rpc(Some(-32000), msg)
}

impl State {
    fn tip(&self) -> Head {
        self.canonical.last().cloned().unwrap_or_else(|| make_head(0, H256::zero(), 0))
    }

    fn push_block(&mut self, include_txs: bool) -> Head {
        let parent = self.tip();
        let head = make_head(parent.number + 1, parent.hash, self.fork_counter);
        if include_txs && !self.withhold_receipts {
            self.include_mempool(&head);
        }
        self.canonical.push(head.clone());
        self.all_heads.insert(head.hash, head.clone());
        head
    }

    fn include_mempool(&mut self, head: &Head) {
        let mut tx_index = 0;
        loop {
            // best priced candidate for each sender's next nonce
            let mut best: HashMap<Address, usize> = HashMap::new();
            for (i, tx) in self.mempool.iter().enumerate() {
                let next = self.account_nonces.get(&tx.from).copied().unwrap_or_default();
                if tx.nonce != next {
                    continue;
                }
                match best.get(&tx.from) {
                    Some(&j) if self.mempool[j].gas_price >= tx.gas_price => {}
                    _ => {
                        best.insert(tx.from, i);
                    }
                }
            }
            if best.is_empty() {
                break;
            }
            let mut chosen: Vec<usize> = best.into_values().collect();
            chosen.sort_unstable();
            let picked: Vec<SentTx> = chosen.iter().map(|&i| self.mempool[i].clone()).collect();
            for tx in picked {
                self.receipts.insert(
                    tx.hash,
                    TxReceipt {
                        tx_hash: tx.hash,
                        block_hash: Some(head.hash),
                        block_number: Some(head.number),
                        tx_index,
                        status: Some(true),
                        gas_used: Some(21_000),
                    },
                );
                self.included.insert(
                    tx.hash,
                    Included {
                        block_number: head.number,
                        from: tx.from,
                        nonce: tx.nonce,
                    },
                );
                self.account_nonces.insert(tx.from, tx.nonce + 1);
                tx_index += 1;
            }
            // replaced or now stale transactions leave the pool
            let nonces = self.account_nonces.clone();
            self.mempool.retain(|tx| {
                tx.nonce >= nonces.get(&tx.from).copied().unwrap_or_default()
            });
        }
    }

    fn notify_heads(&mut self, heads: &[Head]) {
        self.head_subscribers.retain(|s| !s.is_closed());
        for head in heads {
            for sub in &self.head_subscribers {
                let _ = sub.try_send(head.clone());
            }
        }
    }

    fn notify_log(&mut self, log: &Log) {
        self.log_subscribers.retain(|(_, s)| !s.is_closed());
        for (filter, sub) in &self.log_subscribers {
            if filter.matches(log) {
                let _ = sub.try_send(log.clone());
            }
        }
    }
}

impl SimulatedChain {
    /// A chain holding only the genesis block.
    pub fn new(chain_id: u64) -> Self {
        let genesis = make_head(0, H256::zero(), 0);
        let mut state = State::default();
        state.all_heads.insert(genesis.hash, genesis.clone());
        state.canonical.push(genesis);
        Self {
            chain_id,
            state: Mutex::new(state),
            sends_stalled: watch::channel(false).0,
        }
    }

    /// A chain with `height` empty blocks on top of genesis.
    pub fn with_height(chain_id: u64, height: u64) -> Self {
        let chain = Self::new(chain_id);
        {
            let mut state = chain.state.lock();
            for _ in 0..height {
                state.push_block(false);
            }
        }
        chain
    }

    /// Current canonical tip.
    pub fn tip(&self) -> Head {
        self.state.lock().tip()
    }

    /// Canonical head at `number`.
    pub fn canonical_head(&self, number: u64) -> Option<Head> {
        self.state.lock().canonical.get(number as usize).cloned()
    }

    /// Mines one block, including pending transactions unless receipts are
    /// withheld, and notifies head subscribers.
    pub fn mine_block(&self) -> Head {
        let mut state = self.state.lock();
        let head = state.push_block(true);
        state.notify_heads(std::slice::from_ref(&head));
        head
    }

    /// Mines `n` blocks and returns the new tip.
    pub fn mine_blocks(&self, n: u64) -> Head {
        let mut tip = self.tip();
        for _ in 0..n {
            tip = self.mine_block();
        }
        tip
    }

    /// Replaces the newest `depth` canonical blocks with a fork of `depth`
    /// empty blocks, then mines one more block on top so the fork is the
    /// longest chain. Receipts in orphaned blocks vanish; their
    /// transactions are dropped unless [`Self::set_requeue_reorged`] is on.
    /// Returns the new tip.
    pub fn reorg(&self, depth: u64) -> Head {
        let mut state = self.state.lock();
        let tip_number = state.tip().number;
        let depth = depth.min(tip_number);
        let keep = (tip_number - depth + 1) as usize;
        state.canonical.truncate(keep);
        let orphaned_from = tip_number - depth + 1;

        let orphaned: Vec<(H256, Included)> = state
            .included
            .iter()
            .filter(|(_, inc)| inc.block_number >= orphaned_from)
            .map(|(h, inc)| (*h, inc.clone()))
            .collect();
        for (hash, inc) in &orphaned {
            state.receipts.remove(hash);
            state.included.remove(hash);
            let nonce = state.account_nonces.entry(inc.from).or_default();
            *nonce = (*nonce).min(inc.nonce);
            if state.requeue_reorged {
                if let Some(tx) = state.sent.iter().find(|t| t.hash == *hash).cloned() {
                    state.mempool.push(tx);
                }
            }
        }

        state.fork_counter += 1;
        let mut new_heads = Vec::new();
        for _ in 0..depth {
            new_heads.push(state.push_block(false));
        }
        new_heads.push(state.push_block(true));
        state.notify_heads(&new_heads);
        new_heads.last().cloned().unwrap_or_else(|| state.tip())
    }

    /// Pushes `head` to subscribers without touching the chain.
    pub fn push_head(&self, head: Head) {
        let mut state = self.state.lock();
        state.all_heads.insert(head.hash, head.clone());
        state.notify_heads(&[head]);
    }

    /// While on, mined blocks include no transactions.
    pub fn set_withhold_receipts(&self, withhold: bool) {
        self.state.lock().withhold_receipts = withhold;
    }

    /// While on, transactions orphaned by a reorg return to the pool.
    pub fn set_requeue_reorged(&self, requeue: bool) {
        self.state.lock().requeue_reorged = requeue;
    }

    /// While on, sends wait without reaching the pool.
    pub fn set_sends_stalled(&self, stalled: bool) {
        self.sends_stalled.send_replace(stalled);
    }

    /// The next send fails with `err` before reaching the pool.
    pub fn push_send_error(&self, err: ChainCommunicationError) {
        self.state.lock().send_errors.push_back(err);
    }

    /// While on, new subscriptions fail.
    pub fn set_subscriptions_failing(&self, failing: bool) {
        self.state.lock().subscriptions_failing = failing;
    }

    /// Ends every open subscription.
    pub fn close_subscriptions(&self) {
        let mut state = self.state.lock();
        state.head_subscribers.clear();
        state.log_subscribers.clear();
    }

    /// Number of open head subscriptions.
    pub fn head_subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.head_subscribers.retain(|s| !s.is_closed());
        state.head_subscribers.len()
    }

    /// Every transaction accepted so far, in order.
    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().sent.clone()
    }

    /// Transactions waiting to be mined.
    pub fn mempool(&self) -> Vec<SentTx> {
        self.state.lock().mempool.clone()
    }

    /// Evicts a pending transaction, as a node under memory pressure does.
    pub fn drop_from_mempool(&self, hash: H256) {
        self.state.lock().mempool.retain(|tx| tx.hash != hash);
    }

    /// Receipt of a mined transaction.
    pub fn receipt_of(&self, hash: H256) -> Option<TxReceipt> {
        self.state.lock().receipts.get(&hash).cloned()
    }

    /// Marks a mined transaction as reverted.
    pub fn revert_tx(&self, hash: H256) {
        if let Some(r) = self.state.lock().receipts.get_mut(&hash) {
            r.status = Some(false);
        }
    }

    /// Nonce of the next transaction `address` can get mined.
    pub fn account_nonce(&self, address: Address) -> u64 {
        self.state
            .lock()
            .account_nonces
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Sets the balance reported for `address`.
    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    /// Sets the bytes returned by calls to `to`.
    pub fn set_call_result(&self, to: Address, result: Bytes) {
        self.state.lock().call_results.insert(to, result);
    }

    /// Emits a log in the current tip and returns it.
    pub fn emit_log(&self, address: Address, topics: Vec<H256>, data: Bytes) -> Log {
        let mut state = self.state.lock();
        let tip = state.tip();
        let log_index = state
            .logs
            .iter()
            .filter(|l| l.block_hash == tip.hash)
            .count() as u64;
        let log = Log {
            address,
            topics,
            data,
            block_hash: tip.hash,
            block_number: tip.number,
            tx_hash: H256::from(keccak256(
                [tip.hash.as_bytes(), &log_index.to_be_bytes()].concat(),
            )),
            tx_index: 0,
            log_index,
            removed: false,
        };
        state.logs.push(log.clone());
        state.notify_log(&log);
        log
    }

    /// Re-emits `log` flagged as removed.
    pub fn emit_removed(&self, log: &Log) {
        let mut state = self.state.lock();
        state
            .logs
            .retain(|l| !(l.block_hash == log.block_hash && l.log_index == log.log_index));
        let removed = Log {
            removed: true,
            ..log.clone()
        };
        state.notify_log(&removed);
    }

    fn decode(raw: &Bytes) -> ChainResult<(H256, Address, u64, U256)> {
        let (tx, sig) = TypedTransaction::decode_signed(&Rlp::new(raw))
            .map_err(|e| rpc_err(&format!("rlp: {e}")))?;
        let from = sig
            .recover(tx.sighash())
            .map_err(|_| rpc_err("invalid sender"))?;
        let nonce = tx.nonce().map(|n| n.low_u64()).unwrap_or_default();
        let gas_price = tx.gas_price().unwrap_or_default();
        Ok((H256::from(keccak256(raw)), from, nonce, gas_price))
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> ChainResult<u64> {
        Ok(self.tip().number)
    }

    async fn head_by_number(&self, number: Option<u64>) -> ChainResult<Option<Head>> {
        Ok(match number {
            Some(n) => self.canonical_head(n),
            None => Some(self.tip()),
        })
    }

    async fn head_by_hash(&self, hash: H256) -> ChainResult<Option<Head>> {
        Ok(self.state.lock().all_heads.get(&hash).cloned())
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>> {
        Ok(self.receipt_of(hash))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        let mut stalled = self.sends_stalled.subscribe();
        // the sender lives as long as the chain
        let _ = stalled.wait_for(|stalled| !*stalled).await;
        let mut state = self.state.lock();
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }
        let (hash, from, nonce, gas_price) = Self::decode(&raw)?;
        if state.mempool.iter().any(|t| t.hash == hash) || state.receipts.contains_key(&hash) {
            return Err(rpc_err("already known"));
        }
        let next = state.account_nonces.get(&from).copied().unwrap_or_default();
        if nonce < next {
            return Err(rpc_err("nonce too low"));
        }
        let best_pending = state
            .mempool
            .iter()
            .filter(|t| t.from == from && t.nonce == nonce)
            .map(|t| t.gas_price)
            .max();
        if best_pending.is_some_and(|best| best >= gas_price) {
            return Err(rpc_err("replacement transaction underpriced"));
        }
        let tx = SentTx {
            hash,
            from,
            nonce,
            gas_price,
            raw,
        };
        state.sent.push(tx.clone());
        state.mempool.push(tx);
        Ok(hash)
    }

    async fn pending_nonce_at(&self, address: Address) -> ChainResult<u64> {
        let state = self.state.lock();
        let mined = state.account_nonces.get(&address).copied().unwrap_or_default();
        let pending = state
            .mempool
            .iter()
            .filter(|t| t.from == address)
            .map(|t| t.nonce + 1)
            .max()
            .unwrap_or_default();
        Ok(mined.max(pending))
    }

    async fn subscribe_new_heads(&self) -> ChainResult<Subscription<Head>> {
        let mut state = self.state.lock();
        if state.subscriptions_failing {
            return Err(ChainCommunicationError::Transport(
                "connection refused".into(),
            ));
        }
        let (sender, sub) = Subscription::channel(SUBSCRIPTION_BUFFER);
        state.head_subscribers.push(sender);
        Ok(sub)
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> ChainResult<Subscription<Log>> {
        let mut state = self.state.lock();
        if state.subscriptions_failing {
            return Err(ChainCommunicationError::Transport(
                "connection refused".into(),
            ));
        }
        let (sender, sub) = Subscription::channel(SUBSCRIPTION_BUFFER);
        state.log_subscribers.push((filter, sender));
        Ok(sub)
    }

    async fn filter_logs(&self, filter: LogFilter) -> ChainResult<Vec<Log>> {
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect())
    }

    async fn balance_at(&self, address: Address, _block: Option<u64>) -> ChainResult<U256> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_else(|| U256::exp10(18)))
    }

    async fn call_contract(&self, call: CallRequest, _block: Option<u64>) -> ChainResult<Bytes> {
        self.state
            .lock()
            .call_results
            .get(&call.to)
            .cloned()
            .ok_or_else(|| rpc_err("execution reverted"))
    }
}

/// A key store holding `n` deterministic keys.
pub fn test_key_store(n: u8) -> LocalKeyStore {
    let mut store = LocalKeyStore::default();
    for i in 1..=n {
        let mut secret = [0u8; 32];
        secret[31] = i;
        secret[0] = 0x42;
        if let Ok(wallet) = LocalWallet::from_bytes(&secret) {
            store.insert(wallet);
        }
    }
    store
}
