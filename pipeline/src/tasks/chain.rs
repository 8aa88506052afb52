use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use oracle_core::{Address, Bytes, CallRequest, H256, U256};
use txm::{NewTx, TxManager, TxOutcome, TxmError};

use super::{parse_address, parse_h256, to_hex, TaskContext, TaskError, TaskOutcome};

/// A transaction an `ethtx` task wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTxRequest {
    /// Acceptable sending keys; any sending key when empty
    pub from: Vec<Address>,
    /// Recipient
    pub to: Address,
    /// Calldata
    pub data: Bytes,
    /// Value in wei
    pub value: U256,
    /// Gas limit override
    pub gas_limit: Option<u64>,
    /// Confirmation count override
    pub min_confirmations: Option<u64>,
    /// The suspended task run waiting on the outcome
    pub task_run_id: Uuid,
}

/// Where `ethtx` tasks send their transactions.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait TxSubmitter: Send + Sync + Debug {
    /// Queues the transaction. Submitting twice for the same task run queues
    /// it once.
    async fn submit(&self, request: EthTxRequest) -> eyre::Result<()>;

    /// The final outcome of the task run's transaction, if there is one yet.
    async fn outcome(&self, task_run_id: Uuid) -> eyre::Result<Option<TxOutcome>>;

    /// Gives up on the task run's transaction. One already broadcast is
    /// still mined so its nonce is not left open, but the task run is no
    /// longer resumed with its outcome.
    async fn abandon(&self, task_run_id: Uuid, reason: &str) -> eyre::Result<bool>;
}

#[async_trait]
impl TxSubmitter for TxManager {
    async fn submit(&self, request: EthTxRequest) -> eyre::Result<()> {
        if let Some(tx) = self.tx_for_task_run(request.task_run_id).await? {
            debug!(id = tx.id, task_run_id = %request.task_run_id, "Transaction already queued");
            return Ok(());
        }
        let candidates = if request.from.is_empty() {
            self.sending_keys().await?
        } else {
            request.from.clone()
        };

        let mut last_err = None;
        for from in candidates {
            let tx = NewTx {
                from,
                to: request.to,
                payload: request.data.clone(),
                value: request.value,
                gas_limit: request.gas_limit,
                task_run_id: Some(request.task_run_id),
                min_confirmations: request.min_confirmations,
            };
            match self.enqueue(tx).await {
                Ok(_) => return Ok(()),
                Err(e @ (TxmError::QueueFull { .. } | TxmError::Validation(_))) => {
                    debug!(?from, error = %e, "Sending key rejected transaction, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => eyre::eyre!("no sending keys available"),
        })
    }

    async fn outcome(&self, task_run_id: Uuid) -> eyre::Result<Option<TxOutcome>> {
        Ok(self.task_run_outcome(task_run_id).await?)
    }

    async fn abandon(&self, task_run_id: Uuid, reason: &str) -> eyre::Result<bool> {
        Ok(self.abandon_task_run_tx(task_run_id, reason).await?)
    }
}

/// Input of a VRF proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfRequest {
    /// Compressed public key of the proving key
    pub public_key: String,
    /// Hash of the block holding the request
    pub block_hash: H256,
    /// Number of the block holding the request
    pub block_number: u64,
    /// Request data the seed is derived from
    pub topics: Value,
}

/// Generates VRF proofs with the node's keys.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait VrfProver: Send + Sync + Debug {
    /// Proof for `request`, encoded for on-chain verification.
    async fn prove(&self, request: &VrfRequest) -> eyre::Result<Bytes>;
}

pub(super) async fn eth_call(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let call = CallRequest {
        from: ctx.address("from")?,
        to: ctx
            .address("contract")?
            .ok_or(TaskError::MissingParam("contract"))?,
        data: ctx.bytes("data")?.unwrap_or_default(),
        gas: ctx.u64("gas")?,
    };
    let out = ctx
        .env
        .chain
        .call_contract(call, None)
        .await
        .map_err(|e| TaskError::Chain(e.to_string()))?;
    Ok(Value::String(to_hex(&out)))
}

fn senders(ctx: &TaskContext<'_>) -> Result<Vec<Address>, TaskError> {
    let bad = |reason: String| TaskError::BadParam {
        name: "from",
        reason,
    };
    let raw: Vec<String> = match ctx.json("from")? {
        None | Some(Value::Null) => vec![],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|i| match i {
                Value::String(s) => Ok(s),
                other => Err(bad(format!("{other} is not an address"))),
            })
            .collect::<Result<_, _>>()?,
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        Some(other) => return Err(bad(format!("{other} is not an address list"))),
    };
    raw.iter().map(|s| parse_address(s).map_err(bad)).collect()
}

pub(super) async fn eth_tx(ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
    let value = match ctx.string("value")? {
        Some(s) if !s.trim().is_empty() => {
            U256::from_dec_str(s.trim()).map_err(|e| TaskError::BadParam {
                name: "value",
                reason: format!("{e:?}"),
            })?
        }
        _ => U256::zero(),
    };
    let request = EthTxRequest {
        from: senders(ctx)?,
        to: ctx.address("to")?.ok_or(TaskError::MissingParam("to"))?,
        data: ctx.bytes("data")?.unwrap_or_default(),
        value,
        gas_limit: ctx.u64("gasLimit")?,
        min_confirmations: ctx.u64("minConfirmations")?,
        task_run_id: ctx.task_run_id,
    };
    ctx.env
        .txs
        .submit(request)
        .await
        .map_err(|e| TaskError::Chain(e.to_string()))?;
    Ok(TaskOutcome::Pending)
}

pub(super) async fn vrf(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let prover = ctx
        .env
        .vrf
        .as_ref()
        .ok_or_else(|| TaskError::Unsupported("no VRF keys configured".into()))?;
    let block_hash = ctx.required_string("requestBlockHash")?;
    let request = VrfRequest {
        public_key: ctx.required_string("publicKey")?,
        block_hash: parse_h256(&block_hash).map_err(|reason| TaskError::BadParam {
            name: "requestBlockHash",
            reason,
        })?,
        block_number: ctx
            .u64("requestBlockNumber")?
            .ok_or(TaskError::MissingParam("requestBlockNumber"))?,
        topics: ctx.json("topics")?.unwrap_or(Value::Null),
    };
    let proof = prover
        .prove(&request)
        .await
        .map_err(|e| TaskError::Chain(e.to_string()))?;
    Ok(Value::String(to_hex(&proof)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use oracle_test::SimulatedChain;

    use super::*;
    use crate::{
        tasks::{test_utils::*, TaskType},
        Vars,
    };

    #[derive(Debug)]
    struct FixedProver;

    #[async_trait]
    impl VrfProver for FixedProver {
        async fn prove(&self, request: &VrfRequest) -> eyre::Result<Bytes> {
            Ok(Bytes::from(request.block_number.to_be_bytes().to_vec()))
        }
    }

    #[tokio::test]
    async fn eth_call_returns_hex() {
        let (env, chain, _) = test_env().await;
        let contract = Address::repeat_byte(7);
        chain.set_call_result(contract, Bytes::from(vec![0xde, 0xad]));

        let vars = Vars::new(json!({"addr": format!("{contract:?}")}));
        let spec = spec(
            TaskType::EthCall,
            &[("contract", "$(addr)"), ("data", "0x1234")],
        );
        let out = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap();
        assert_eq!(out, json!("0xdead"));

        let spec = spec_for_unknown_contract();
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert!(matches!(err, TaskError::Chain(_)));
    }

    fn spec_for_unknown_contract() -> crate::dag::TaskSpec {
        spec(
            TaskType::EthCall,
            &[("contract", "0x0909090909090909090909090909090909090909")],
        )
    }

    #[tokio::test]
    async fn eth_tx_submits_and_suspends() {
        let (env, _, submitter) = test_env().await;
        let vars = Vars::new(json!({"to": "0x0202020202020202020202020202020202020202"}));
        let spec = spec(
            TaskType::EthTx,
            &[
                ("to", "$(to)"),
                ("data", "0xabcd"),
                ("value", "1000"),
                ("minConfirmations", "3"),
                ("from", "[\"0x0101010101010101010101010101010101010101\"]"),
            ],
        );
        let task = ctx(&env, &spec, &vars, vec![]);
        assert_eq!(
            crate::tasks::run_task(&task).await.unwrap(),
            TaskOutcome::Pending
        );

        let requests = submitter.requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.task_run_id, task.task_run_id);
        assert_eq!(req.to, Address::repeat_byte(2));
        assert_eq!(req.from, vec![Address::repeat_byte(1)]);
        assert_eq!(req.data.to_vec(), vec![0xab, 0xcd]);
        assert_eq!(req.value, U256::from(1000));
        assert_eq!(req.min_confirmations, Some(3));
    }

    #[tokio::test]
    async fn eth_tx_requires_a_recipient() {
        let (env, _, _) = test_env().await;
        let vars = Vars::default();
        let spec = spec(TaskType::EthTx, &[("data", "0x")]);
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert_eq!(err, TaskError::MissingParam("to"));
    }

    #[tokio::test]
    async fn vrf_needs_a_prover() {
        let (mut env, _, _) = test_env().await;
        let vars = Vars::default();
        let spec = spec(
            TaskType::Vrf,
            &[
                ("publicKey", "0xkey"),
                (
                    "requestBlockHash",
                    "0x0303030303030303030303030303030303030303030303030303030303030303",
                ),
                ("requestBlockNumber", "258"),
            ],
        );
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert!(matches!(err, TaskError::Unsupported(_)));

        env.vrf = Some(Arc::new(FixedProver));
        let out = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap();
        assert_eq!(out, json!("0x0000000000000102"));
    }

    #[tokio::test]
    async fn tx_manager_submission_is_idempotent() {
        let (mgr, _chain) = test_tx_manager().await;
        let task_run_id = Uuid::new_v4();
        let request = EthTxRequest {
            from: vec![],
            to: Address::repeat_byte(2),
            data: Bytes::default(),
            value: U256::zero(),
            gas_limit: None,
            min_confirmations: None,
            task_run_id,
        };
        mgr.submit(request.clone()).await.unwrap();
        mgr.submit(request).await.unwrap();

        let tx = mgr.tx_for_task_run(task_run_id).await.unwrap().unwrap();
        assert_eq!(tx.task_run_id, Some(task_run_id));
        assert_eq!(mgr.outcome(task_run_id).await.unwrap(), None);
        assert!(mgr.abandon(task_run_id, "test").await.unwrap());
        assert_eq!(
            mgr.outcome(task_run_id).await.unwrap(),
            Some(Err("test".into()))
        );
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let (mgr, _chain) = test_tx_manager().await;
        let err = mgr
            .submit(EthTxRequest {
                from: vec![Address::repeat_byte(9)],
                to: Address::repeat_byte(2),
                data: Bytes::default(),
                value: U256::zero(),
                gas_limit: None,
                min_confirmations: None,
                task_run_id: Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validation"));
    }

    async fn test_tx_manager() -> (TxManager, Arc<SimulatedChain>) {
        use oracle_base::db::OracleDb;
        use oracle_core::ChainHealth;
        use tokio::sync::watch;

        let chain = Arc::new(SimulatedChain::with_height(1337, 10));
        let db = OracleDb::in_memory().await.unwrap();
        let (_, health) = watch::channel(ChainHealth::Healthy);
        let mgr = TxManager::new(
            Arc::new(db),
            chain.clone(),
            Arc::new(oracle_test::test_key_store(1)),
            txm::TxmConfig {
                chain_id: 1337,
                ..Default::default()
            },
            txm::TxmMetrics::dummy_instance(),
            health,
        );
        (mgr, chain)
    }
}
