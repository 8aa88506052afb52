//! Node configuration.
//!
//! Besides the shared [`Settings`], the node reads one section per
//! subsystem: `headTracker`, `txm`, `pipeline` and `jobs`. Every key has a
//! default, see `config/oracle.json`.

use derive_more::{AsMut, AsRef, Deref, DerefMut};
use serde_json::Value;

use headtracker::HeadTrackerConfig;
use jobs::JobsConfig;
use oracle_base::{
    settings::{
        ConfigParsingError, ConfigResult, FromRawConf, Settings, ValueParser,
        DEFAULT_FINALITY_DEPTH,
    },
    LoadableFromSettings,
};
use pipeline::RunnerConfig;
use txm::TxmConfig;

/// Settings for `OracleNode`
#[derive(Debug, AsRef, AsMut, Deref, DerefMut)]
pub struct NodeSettings {
    #[as_ref]
    #[as_mut]
    #[deref]
    #[deref_mut]
    base: Settings,

    /// Head tracker tunables
    pub head_tracker: HeadTrackerConfig,
    /// Transaction manager tunables
    pub txm: TxmConfig,
    /// Pipeline runner tunables
    pub pipeline: RunnerConfig,
    /// Job spawner tunables
    pub jobs: JobsConfig,
}

impl LoadableFromSettings for NodeSettings {}

impl FromRawConf for NodeSettings {
    fn from_config(raw: &Value) -> ConfigResult<Self> {
        let mut err = ConfigParsingError::default();

        let base = match Settings::from_config(raw) {
            Ok(base) => Some(base),
            Err(e) => {
                err.merge(e);
                None
            }
        };
        let finality_depth = base
            .as_ref()
            .map(|b| b.chain.finality_depth)
            .unwrap_or(DEFAULT_FINALITY_DEPTH);

        let root = ValueParser::new(raw);
        let head_tracker =
            HeadTrackerConfig::from_section(&root.section("headTracker"), finality_depth, &mut err);

        let mut txm = TxmConfig::from_section(&root.section("txm"), &mut err);
        txm.finality_depth = finality_depth;
        if let Some(chain_id) = base.as_ref().and_then(|b| b.chain.chain_id) {
            txm.chain_id = chain_id;
        }
        if txm.min_confirmations > finality_depth {
            err.push(
                "txm.minConfirmations",
                eyre::eyre!("must not exceed chain.finalityDepth ({finality_depth})"),
            );
        }

        let pipeline = RunnerConfig::from_section(&root.section("pipeline"), &mut err);
        let jobs = JobsConfig::from_section(&root.section("jobs"), finality_depth, &mut err);

        match base {
            Some(base) if err.is_ok() => Ok(Self {
                base,
                head_tracker,
                txm,
                pipeline,
                jobs,
            }),
            _ => Err(err),
        }
    }
}
