//! Job specs: the TOML an operator submits, and the validated form the
//! spawner stores and dispatches on.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use oracle_core::{Address, U256};
use pipeline::Pipeline;

use crate::{cron::CronSchedule, JobError, JobResult};

/// Only schema version understood by this node.
pub const SCHEMA_VERSION: u32 = 1;

/// Every job type a spec may name. Only some have a delegate on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum JobType {
    /// Runs on a schedule
    Cron,
    /// Runs for each oracle request log
    DirectRequest,
    /// Runs when called over HTTP
    Webhook,
    /// Flux monitor
    FluxMonitor,
    /// Off-chain reporting
    OffchainReporting,
    /// Verifiable randomness
    Vrf,
    /// Upkeep keeper
    Keeper,
}

impl JobType {
    /// Whether this node can run jobs of the type.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Cron | Self::DirectRequest | Self::Webhook)
    }
}

/// Settings of a direct request job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectRequestSpec {
    /// Oracle contract emitting the request logs
    pub contract_address: Address,
    /// Requesters allowed to trigger the job; empty allows everyone
    #[serde(default)]
    pub requesters: Vec<Address>,
    /// Minimum payment a request must carry
    pub min_contract_payment: U256,
    /// Blocks a request waits for; the finality depth when unset
    pub min_incoming_confirmations: Option<u64>,
}

/// The type specific part of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    /// Runs on a schedule
    Cron {
        /// `CRON_TZ=<tz>` followed by six fields
        schedule: String,
    },
    /// Runs for each oracle request log
    DirectRequest(DirectRequestSpec),
    /// Runs when called over HTTP
    Webhook,
}

impl JobKind {
    /// The type tag.
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Cron { .. } => JobType::Cron,
            Self::DirectRequest(_) => JobType::DirectRequest,
            Self::Webhook => JobType::Webhook,
        }
    }
}

/// A validated job spec not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Externally visible id; generated when the TOML has none
    pub external_job_id: Uuid,
    /// Operator chosen name
    pub name: Option<String>,
    /// Spec format version
    pub schema_version: u32,
    /// DOT source of the pipeline
    pub pipeline_source: String,
    /// Overrides the node wide maximum task duration
    pub max_task_duration: Option<Duration>,
    /// Type specific settings
    pub kind: JobKind,
    /// The submitted TOML
    pub source: String,
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Database id
    pub id: i64,
    /// Externally visible id
    #[serde(rename = "externalJobID")]
    pub external_job_id: Uuid,
    /// Operator chosen name
    pub name: Option<String>,
    /// Spec format version
    pub schema_version: u32,
    /// Pipeline the job runs
    pub pipeline_spec_id: i64,
    /// DOT source of the pipeline
    pub pipeline_source: String,
    /// Overrides the node wide maximum task duration
    #[serde(with = "humantime_serde_opt")]
    pub max_task_duration: Option<Duration>,
    /// Type specific settings
    #[serde(flatten)]
    pub kind: JobKind,
    /// The submitted TOML
    pub source: String,
    /// Hash of the token authorising webhook runs
    #[serde(skip)]
    pub webhook_token_hash: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// The type tag.
    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    /// Run vars describing the job, with `job_run` under `jobRun`.
    pub fn run_vars(&self, job_run: Value) -> Value {
        json!({
            "jobSpec": {
                "databaseID": self.id,
                "externalJobID": self.external_job_id.to_string(),
                "name": self.name,
            },
            "jobRun": job_run,
        })
    }
}

mod humantime_serde_opt {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Amount {
    Int(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJobSpec {
    #[serde(rename = "type")]
    job_type: String,
    schema_version: u32,
    name: Option<String>,
    #[serde(rename = "externalJobID")]
    external_job_id: Option<String>,
    observation_source: String,
    max_task_duration: Option<String>,
    schedule: Option<String>,
    contract_address: Option<String>,
    requesters: Option<Vec<String>>,
    min_contract_payment_link_juels: Option<Amount>,
    min_incoming_confirmations: Option<u64>,
}

fn parse_address(field: &str, s: &str) -> JobResult<Address> {
    let s = s.trim();
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    match hex::decode(stripped) {
        Ok(bytes) if bytes.len() == 20 => Ok(Address::from_slice(&bytes)),
        _ => Err(JobError::validation(format!(
            "{field}: {s:?} is not a hex address"
        ))),
    }
}

impl NewJob {
    /// Parses and validates a TOML job spec.
    pub fn parse(toml: &str) -> JobResult<Self> {
        let raw: RawJobSpec = toml_edit::de::from_str(toml)
            .map_err(|e| JobError::validation(format!("invalid job spec: {e}")))?;

        let job_type = JobType::from_str(raw.job_type.trim())
            .map_err(|_| JobError::validation(format!("unknown job type {:?}", raw.job_type)))?;
        if !job_type.is_supported() {
            return Err(JobError::validation(format!(
                "unsupported job type {job_type}"
            )));
        }
        if raw.schema_version != SCHEMA_VERSION {
            return Err(JobError::validation(format!(
                "unsupported schemaVersion {}, expected {SCHEMA_VERSION}",
                raw.schema_version
            )));
        }
        let external_job_id = match raw.external_job_id.as_deref().map(str::trim) {
            None | Some("") => Uuid::new_v4(),
            Some(s) => Uuid::parse_str(s)
                .map_err(|e| JobError::validation(format!("externalJobID: {e}")))?,
        };
        Pipeline::parse(&raw.observation_source)?;
        let max_task_duration = raw
            .max_task_duration
            .as_deref()
            .map(|s| {
                humantime::parse_duration(s.trim())
                    .map_err(|e| JobError::validation(format!("maxTaskDuration: {e}")))
            })
            .transpose()?;
        if max_task_duration.is_some_and(|d| d.is_zero()) {
            return Err(JobError::validation("maxTaskDuration must be positive"));
        }

        let kind = match job_type {
            JobType::Cron => {
                let schedule = raw
                    .schedule
                    .ok_or_else(|| JobError::validation("cron jobs need a schedule"))?;
                CronSchedule::parse(&schedule).map_err(JobError::Validation)?;
                JobKind::Cron { schedule }
            }
            JobType::DirectRequest => {
                let contract_address = parse_address(
                    "contractAddress",
                    raw.contract_address.as_deref().ok_or_else(|| {
                        JobError::validation("directrequest jobs need a contractAddress")
                    })?,
                )?;
                let requesters = raw
                    .requesters
                    .unwrap_or_default()
                    .iter()
                    .map(|r| parse_address("requesters", r))
                    .collect::<JobResult<_>>()?;
                let min_contract_payment = match raw.min_contract_payment_link_juels {
                    None => U256::zero(),
                    Some(Amount::Int(n)) => U256::from(n),
                    Some(Amount::Text(s)) => U256::from_dec_str(s.trim()).map_err(|e| {
                        JobError::validation(format!("minContractPaymentLinkJuels: {e:?}"))
                    })?,
                };
                JobKind::DirectRequest(DirectRequestSpec {
                    contract_address,
                    requesters,
                    min_contract_payment,
                    min_incoming_confirmations: raw.min_incoming_confirmations,
                })
            }
            JobType::Webhook => JobKind::Webhook,
            other => {
                return Err(JobError::validation(format!(
                    "unsupported job type {other}"
                )))
            }
        };

        Ok(Self {
            external_job_id,
            name: raw.name.filter(|n| !n.trim().is_empty()),
            schema_version: raw.schema_version,
            pipeline_source: raw.observation_source,
            max_task_duration,
            kind,
            source: toml.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"observationSource = """
    fetch [type=http method=GET url="https://example.com/price"];
    parse [type=jsonparse path="usd"];
    fetch -> parse;
""""#;

    fn toml(body: &str) -> String {
        format!("schemaVersion = 1\n{body}\n{PIPELINE}\n")
    }

    #[test]
    fn cron_spec() {
        let job = NewJob::parse(&toml(
            "type = \"cron\"\nname = \"price\"\nschedule = \"CRON_TZ=UTC 0 */5 * * * *\"\nmaxTaskDuration = \"10s\"",
        ))
        .unwrap();
        assert_eq!(
            job.kind,
            JobKind::Cron {
                schedule: "CRON_TZ=UTC 0 */5 * * * *".into()
            }
        );
        assert_eq!(job.name.as_deref(), Some("price"));
        assert_eq!(job.max_task_duration, Some(Duration::from_secs(10)));
        assert!(job.pipeline_source.contains("jsonparse"));
    }

    #[test]
    fn direct_request_spec() {
        let job = NewJob::parse(&toml(
            r#"type = "directrequest"
externalJobID = "0eec7e1d-d0d2-476c-a1a8-72dfb6633f46"
contractAddress = "0x613a38AC1659769640aaE063C651F48E0250454C"
requesters = ["0x0101010101010101010101010101010101010101"]
minContractPaymentLinkJuels = "1000000000000000000"
minIncomingConfirmations = 3"#,
        ))
        .unwrap();
        assert_eq!(
            job.external_job_id.to_string(),
            "0eec7e1d-d0d2-476c-a1a8-72dfb6633f46"
        );
        let JobKind::DirectRequest(spec) = job.kind else {
            unreachable!("wrong kind {:?}", job.kind);
        };
        assert_eq!(spec.requesters, vec![Address::repeat_byte(1)]);
        assert_eq!(spec.min_contract_payment, U256::exp10(18));
        assert_eq!(spec.min_incoming_confirmations, Some(3));

        let job = NewJob::parse(&toml(
            "type = \"directrequest\"\ncontractAddress = \"0x613a38AC1659769640aaE063C651F48E0250454C\"\nminContractPaymentLinkJuels = 5",
        ))
        .unwrap();
        let JobKind::DirectRequest(spec) = job.kind else {
            unreachable!("wrong kind");
        };
        assert_eq!(spec.min_contract_payment, U256::from(5));
        assert!(spec.requesters.is_empty());
        assert_eq!(spec.min_incoming_confirmations, None);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let cases = [
            (toml("type = \"fluxmonitor\""), "unsupported job type fluxmonitor"),
            (toml("type = \"nope\""), "unknown job type"),
            (toml("type = \"cron\""), "cron jobs need a schedule"),
            (toml("type = \"cron\"\nschedule = \"0 0 * * * *\""), "CRON_TZ"),
            (toml("type = \"directrequest\""), "contractAddress"),
            (
                toml("type = \"directrequest\"\ncontractAddress = \"0x12\""),
                "not a hex address",
            ),
            (
                "type = \"webhook\"\nschemaVersion = 2\nobservationSource = \"a [type=any];\"".into(),
                "schemaVersion",
            ),
            (
                "type = \"webhook\"\nschemaVersion = 1\nobservationSource = \"a -> b -> a;\"".into(),
                "",
            ),
            ("type = ".into(), "invalid job spec"),
        ];
        for (spec, expected) in cases {
            let err = NewJob::parse(&spec).unwrap_err();
            assert!(err.is_validation(), "{spec}: {err}");
            assert!(err.to_string().contains(expected), "{spec}: {err}");
        }
    }

    #[test]
    fn kind_survives_json() {
        let kind = JobKind::DirectRequest(DirectRequestSpec {
            contract_address: Address::repeat_byte(9),
            requesters: vec![],
            min_contract_payment: U256::from(7),
            min_incoming_confirmations: None,
        });
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "directrequest");
        assert_eq!(serde_json::from_value::<JobKind>(value).unwrap(), kind);
        assert_eq!(
            serde_json::to_value(JobKind::Webhook).unwrap(),
            json!({"type": "webhook"})
        );
    }
}
