use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use eyre::{Context, Result};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    metrics::CoreMetrics,
    settings::{loader::load_settings, FromRawConf, Settings},
};

/// Settings of an agent defined from configuration
pub trait LoadableFromSettings: AsRef<Settings> + FromRawConf {
    /// Create a new instance of these settings by reading the configs and env
    /// vars.
    fn load() -> Result<Self> {
        load_settings::<Self>()
    }
}

impl AsRef<Settings> for Settings {
    fn as_ref(&self) -> &Settings {
        self
    }
}

impl LoadableFromSettings for Settings {}

/// A long running process of the node built from settings.
#[async_trait]
pub trait BaseAgent: Send + Sync + Debug {
    /// The agent's name
    const AGENT_NAME: &'static str;

    /// The settings object for this agent
    type Settings: LoadableFromSettings;

    /// Instantiate the agent from its settings. `shutdown` is cancelled on
    /// ctrl-c or when a subsystem hits a fatal error.
    async fn from_settings(
        settings: Self::Settings,
        metrics: Arc<CoreMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Run until `shutdown` is cancelled, then stop every subsystem.
    async fn run(self) -> Result<()>;
}

/// Call this from `main` to fully initialize and run the agent for its entire
/// lifecycle. This will initialize tracing and the metrics registry as well.
pub async fn agent_main<A: BaseAgent>() -> Result<()> {
    let settings = A::Settings::load()?;
    let core_settings: &Settings = settings.as_ref();

    core_settings.tracing.start_tracing()?;
    let metrics = Arc::new(
        CoreMetrics::new(A::AGENT_NAME, core_settings.server.port, Registry::new())
            .context("Failed to register core metrics")?,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal_token.cancel();
            }
            Err(err) => warn!(?err, "Failed to listen for interrupt"),
        }
    });

    let agent = A::from_settings(settings, metrics, shutdown).await?;
    let res = agent.run().await;
    info!(agent = A::AGENT_NAME, "Shutting down agent...");
    res
}
