//! The built-in task types and the environment they run in.

use std::{fmt::Debug, str::FromStr, sync::Arc};

use bigdecimal::BigDecimal;
use serde_json::Value;
use strum::{AsRefStr, Display};
use uuid::Uuid;

use oracle_core::{Address, Bytes, ChainClient, H256};

use crate::{bridges::BridgeStore, dag::TaskSpec, RunnerConfig, Vars};

pub use chain::{EthTxRequest, TxSubmitter, VrfProver, VrfRequest};

mod chain;
mod http;
mod math;
mod parse;

/// The result a predecessor hands to its successors.
pub type TaskInput = Result<Value, String>;

/// Kinds of task a pipeline can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum TaskType {
    /// HTTP request to an arbitrary url
    Http,
    /// HTTP request to a registered external adapter
    Bridge,
    /// Extracts a value from a JSON document
    JsonParse,
    /// Decodes CBOR into JSON
    CborParse,
    /// Decimal multiplication
    Multiply,
    /// Decimal division
    Divide,
    /// Sum of the inputs
    Sum,
    /// Median of the inputs
    Median,
    /// First input that is not an error
    Any,
    /// Read-only contract call
    EthCall,
    /// Outbound transaction through the transaction manager
    EthTx,
    /// VRF proof generation
    Vrf,
    /// Passes its inputs through
    Result,
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Ok(match normalized.as_str() {
            "http" => Self::Http,
            "bridge" => Self::Bridge,
            "jsonparse" => Self::JsonParse,
            "cborparse" => Self::CborParse,
            "multiply" => Self::Multiply,
            "divide" => Self::Divide,
            "sum" => Self::Sum,
            "median" => Self::Median,
            "any" => Self::Any,
            "ethcall" => Self::EthCall,
            "ethtx" => Self::EthTx,
            "vrf" => Self::Vrf,
            "result" => Self::Result,
            _ => return Err(format!("unknown task type {s:?}")),
        })
    }
}

impl TaskType {
    /// Whether the task runs even when predecessors errored. Others fail
    /// with the first upstream error unless they set `failEarly=false`.
    pub fn consumes_errors(&self, attrs: &std::collections::BTreeMap<String, String>) -> bool {
        let attr = |name: &str| {
            attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        };
        if attr("failEarly").is_some_and(|v| v.eq_ignore_ascii_case("false")) {
            return true;
        }
        match self {
            Self::Any => true,
            Self::Sum | Self::Median => attr("allowedFaults").is_some(),
            _ => false,
        }
    }
}

/// What a task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// A value for the successors
    Value(Value),
    /// The result arrives later through a resume
    Pending,
}

/// Why a task failed. Recorded as the task run's error text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A required parameter is absent
    #[error("missing parameter {0:?}")]
    MissingParam(&'static str),
    /// A parameter could not be interpreted
    #[error("invalid parameter {name:?}: {reason}")]
    BadParam {
        /// Parameter name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },
    /// An input the task depends on is an error
    #[error("{0}")]
    Upstream(String),
    /// The remote endpoint failed or answered with an error
    #[error("http: {0}")]
    Http(String),
    /// The data could not be decoded
    #[error("parse: {0}")]
    Parse(String),
    /// Arithmetic is undefined for the inputs
    #[error("math: {0}")]
    Math(String),
    /// Too many inputs are errors
    #[error("{errors} of {total} inputs errored, at most {allowed} allowed")]
    TooManyFaults {
        /// Errored inputs
        errors: usize,
        /// All inputs
        total: usize,
        /// Configured tolerance
        allowed: usize,
    },
    /// The chain or the transaction manager failed
    #[error("chain: {0}")]
    Chain(String),
    /// The node is not set up for this task
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Collaborators available to tasks.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    /// Client of the http and bridge tasks
    pub http: reqwest::Client,
    /// Registered bridges
    pub bridges: Arc<dyn BridgeStore>,
    /// Chain reads
    pub chain: Arc<dyn ChainClient>,
    /// Outbound transactions
    pub txs: Arc<dyn TxSubmitter>,
    /// Proof generation, when the node has VRF keys
    pub vrf: Option<Arc<dyn VrfProver>>,
    /// Runner tunables
    pub config: RunnerConfig,
}

impl TaskEnv {
    /// An environment with a default http client and no VRF prover.
    pub fn new(
        bridges: Arc<dyn BridgeStore>,
        chain: Arc<dyn ChainClient>,
        txs: Arc<dyn TxSubmitter>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            bridges,
            chain,
            txs,
            vrf: None,
            config,
        }
    }
}

/// Everything one task execution sees.
#[derive(Debug)]
pub struct TaskContext<'a> {
    /// Collaborators
    pub env: &'a TaskEnv,
    /// Owning run
    pub run_id: i64,
    /// Id of this task run
    pub task_run_id: Uuid,
    /// The task being executed
    pub spec: &'a TaskSpec,
    /// Run inputs and ancestor outputs
    pub vars: &'a Vars,
    /// Results of the predecessors, in edge order
    pub inputs: Vec<TaskInput>,
}

/// Executes one task.
pub async fn run_task(ctx: &TaskContext<'_>) -> Result<TaskOutcome, TaskError> {
    let value = match ctx.spec.task_type {
        TaskType::Http => http::http(ctx).await?,
        TaskType::Bridge => http::bridge(ctx).await?,
        TaskType::JsonParse => parse::json_parse(ctx)?,
        TaskType::CborParse => parse::cbor_parse(ctx)?,
        TaskType::Multiply => math::multiply(ctx)?,
        TaskType::Divide => math::divide(ctx)?,
        TaskType::Sum => math::sum(ctx)?,
        TaskType::Median => math::median(ctx)?,
        TaskType::Any => any(ctx)?,
        TaskType::EthCall => chain::eth_call(ctx).await?,
        TaskType::EthTx => return chain::eth_tx(ctx).await,
        TaskType::Vrf => chain::vrf(ctx).await?,
        TaskType::Result => result(ctx)?,
    };
    Ok(TaskOutcome::Value(value))
}

fn any(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    ctx.inputs
        .iter()
        .find_map(|i| i.as_ref().ok().cloned())
        .ok_or_else(|| TaskError::Upstream("every input errored".into()))
}

fn result(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let mut values = ctx
        .inputs
        .iter()
        .map(|i| i.clone().map_err(TaskError::Upstream))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

impl TaskContext<'_> {
    /// Raw attribute, matched ignoring case.
    pub(crate) fn raw(&self, name: &str) -> Option<&str> {
        self.spec
            .attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Attribute with variables resolved.
    pub(crate) fn value(&self, name: &'static str) -> Result<Option<Value>, TaskError> {
        self.raw(name)
            .map(|raw| {
                self.vars
                    .interpolate(raw)
                    .map_err(|reason| TaskError::BadParam { name, reason })
            })
            .transpose()
    }

    /// Attribute as text. Non-string values are rendered as JSON.
    pub(crate) fn string(&self, name: &'static str) -> Result<Option<String>, TaskError> {
        Ok(self.value(name)?.map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        }))
    }

    pub(crate) fn required_string(&self, name: &'static str) -> Result<String, TaskError> {
        self.string(name)?
            .filter(|s| !s.trim().is_empty())
            .ok_or(TaskError::MissingParam(name))
    }

    /// Attribute as JSON. Text that parses as JSON is parsed.
    pub(crate) fn json(&self, name: &'static str) -> Result<Option<Value>, TaskError> {
        Ok(self.value(name)?.map(|v| match v {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        }))
    }

    pub(crate) fn bool(&self, name: &'static str, default: bool) -> Result<bool, TaskError> {
        match self.value(name)? {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(b),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| TaskError::BadParam {
                name,
                reason: format!("{s:?} is not a boolean"),
            }),
            Some(other) => Err(TaskError::BadParam {
                name,
                reason: format!("{other} is not a boolean"),
            }),
        }
    }

    pub(crate) fn u64(&self, name: &'static str) -> Result<Option<u64>, TaskError> {
        self.value(name)?
            .map(|v| {
                let parsed = match &v {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                parsed.ok_or_else(|| TaskError::BadParam {
                    name,
                    reason: format!("{v} is not an unsigned integer"),
                })
            })
            .transpose()
    }

    pub(crate) fn decimal(&self, name: &'static str) -> Result<Option<BigDecimal>, TaskError> {
        self.value(name)?
            .map(|v| to_decimal(&v).map_err(|reason| TaskError::BadParam { name, reason }))
            .transpose()
    }

    pub(crate) fn address(&self, name: &'static str) -> Result<Option<Address>, TaskError> {
        self.string(name)?
            .map(|s| parse_address(&s).map_err(|reason| TaskError::BadParam { name, reason }))
            .transpose()
    }

    pub(crate) fn bytes(&self, name: &'static str) -> Result<Option<Bytes>, TaskError> {
        self.string(name)?
            .map(|s| {
                parse_hex(&s)
                    .map(Bytes::from)
                    .map_err(|reason| TaskError::BadParam { name, reason })
            })
            .transpose()
    }

    /// The single predecessor's value.
    pub(crate) fn implicit_input(&self) -> Result<Value, TaskError> {
        match self.inputs.as_slice() {
            [Ok(v)] => Ok(v.clone()),
            [Err(e)] => Err(TaskError::Upstream(e.clone())),
            [] => Err(TaskError::Upstream("task has no input".into())),
            _ => Err(TaskError::Upstream(
                "task has several inputs, name the one to use".into(),
            )),
        }
    }

    /// The attribute, falling back to the single predecessor's value.
    pub(crate) fn value_or_input(&self, name: &'static str) -> Result<Value, TaskError> {
        match self.value(name)? {
            Some(v) => Ok(v),
            None => self.implicit_input(),
        }
    }
}

pub(crate) fn to_decimal(v: &Value) -> Result<BigDecimal, String> {
    let s = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_owned(),
        other => return Err(format!("{other} is not a number")),
    };
    BigDecimal::from_str(&s).map_err(|e| format!("{s:?} is not a number: {e}"))
}

/// Renders a decimal without exponent and without trailing zeros.
pub(crate) fn format_decimal(d: &BigDecimal) -> String {
    let d = d.normalized();
    let (_, scale) = d.as_bigint_and_exponent();
    if scale < 0 {
        d.with_scale(0).to_string()
    } else {
        d.to_string()
    }
}

pub(crate) fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    hex::decode(s).map_err(|e| format!("invalid hex: {e}"))
}

pub(crate) fn parse_address(s: &str) -> Result<Address, String> {
    let bytes = parse_hex(s)?;
    if bytes.len() != 20 {
        return Err(format!("{s:?} is not a 20 byte address"));
    }
    Ok(Address::from_slice(&bytes))
}

pub(crate) fn parse_h256(s: &str) -> Result<H256, String> {
    let bytes = parse_hex(s)?;
    if bytes.len() != 32 {
        return Err(format!("{s:?} is not a 32 byte hash"));
    }
    Ok(H256::from_slice(&bytes))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use uuid::Uuid;

    use oracle_base::db::OracleDb;
    use oracle_test::SimulatedChain;
    use txm::TxOutcome;

    use super::*;

    /// Records submitted transactions; outcomes are set by the test.
    #[derive(Debug, Default)]
    pub struct RecordingSubmitter {
        requests: Mutex<Vec<EthTxRequest>>,
        outcomes: Mutex<HashMap<Uuid, TxOutcome>>,
        abandoned: Mutex<Vec<Uuid>>,
    }

    impl RecordingSubmitter {
        pub fn requests(&self) -> Vec<EthTxRequest> {
            self.requests.lock().clone()
        }

        pub fn set_outcome(&self, task_run_id: Uuid, outcome: TxOutcome) {
            self.outcomes.lock().insert(task_run_id, outcome);
        }

        pub fn abandoned(&self) -> Vec<Uuid> {
            self.abandoned.lock().clone()
        }
    }

    #[async_trait]
    impl TxSubmitter for RecordingSubmitter {
        async fn submit(&self, request: EthTxRequest) -> eyre::Result<()> {
            let mut requests = self.requests.lock();
            if !requests.iter().any(|r| r.task_run_id == request.task_run_id) {
                requests.push(request);
            }
            Ok(())
        }

        async fn outcome(&self, task_run_id: Uuid) -> eyre::Result<Option<TxOutcome>> {
            Ok(self.outcomes.lock().get(&task_run_id).cloned())
        }

        async fn abandon(&self, task_run_id: Uuid, _reason: &str) -> eyre::Result<bool> {
            self.abandoned.lock().push(task_run_id);
            Ok(true)
        }
    }

    /// An environment over an in-memory database and a simulated chain.
    pub async fn test_env() -> (TaskEnv, Arc<SimulatedChain>, Arc<RecordingSubmitter>) {
        let db = OracleDb::in_memory().await.unwrap();
        let chain = Arc::new(SimulatedChain::with_height(1337, 10));
        let submitter = Arc::new(RecordingSubmitter::default());
        let env = TaskEnv::new(
            Arc::new(db),
            chain.clone(),
            submitter.clone(),
            RunnerConfig::default(),
        );
        (env, chain, submitter)
    }

    /// A task spec with the given attributes.
    pub fn spec(task_type: TaskType, attrs: &[(&str, &str)]) -> TaskSpec {
        TaskSpec {
            dot_id: "t".into(),
            task_type,
            attrs: attrs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn ctx<'a>(
        env: &'a TaskEnv,
        spec: &'a TaskSpec,
        vars: &'a Vars,
        inputs: Vec<TaskInput>,
    ) -> TaskContext<'a> {
        TaskContext {
            env,
            run_id: 1,
            task_run_id: Uuid::new_v4(),
            spec,
            vars,
            inputs,
        }
    }

    pub async fn value(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
        match run_task(ctx).await? {
            TaskOutcome::Value(v) => Ok(v),
            TaskOutcome::Pending => Err(TaskError::Unsupported("pending".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn task_types_parse_loosely() {
        assert_eq!("jsonparse".parse::<TaskType>().unwrap(), TaskType::JsonParse);
        assert_eq!("json_parse".parse::<TaskType>().unwrap(), TaskType::JsonParse);
        assert_eq!("ETHTX".parse::<TaskType>().unwrap(), TaskType::EthTx);
        assert_eq!("eth-call".parse::<TaskType>().unwrap(), TaskType::EthCall);
        assert!("bogus".parse::<TaskType>().unwrap_err().contains("bogus"));
        assert_eq!(TaskType::CborParse.to_string(), "cborparse");
    }

    #[test]
    fn error_tolerance() {
        let none = Default::default();
        assert!(TaskType::Any.consumes_errors(&none));
        assert!(!TaskType::Median.consumes_errors(&none));
        assert!(!TaskType::Http.consumes_errors(&none));

        let faults = [("allowedFaults".to_owned(), "1".to_owned())].into();
        assert!(TaskType::Median.consumes_errors(&faults));
        let lenient = [("failEarly".to_owned(), "false".to_owned())].into();
        assert!(TaskType::Http.consumes_errors(&lenient));
    }

    #[test]
    fn decimals_render_plainly() {
        let d = |s: &str| BigDecimal::from_str(s).unwrap();
        assert_eq!(format_decimal(&d("150.00")), "150");
        assert_eq!(format_decimal(&d("1.50")), "1.5");
        assert_eq!(format_decimal(&d("0")), "0");
        assert_eq!(format_decimal(&d("-2.250")), "-2.25");
        assert_eq!(to_decimal(&json!(12)).unwrap(), d("12"));
        assert!(to_decimal(&json!("abc")).is_err());
        assert!(to_decimal(&json!(null)).is_err());
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex("0102").unwrap(), vec![1, 2]);
        assert!(parse_hex("0xzz").is_err());
        assert_eq!(
            parse_address("0x0101010101010101010101010101010101010101").unwrap(),
            Address::repeat_byte(1)
        );
        assert!(parse_address("0x01").is_err());
        assert_eq!(to_hex(&[0xab, 0x01]), "0xab01");
    }
}
