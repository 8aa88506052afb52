use eyre::Result;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    prelude::*,
};

pub use self::fmt::Style;

use super::{ConfigParsingError, ValueParser};

/// Configure a `tracing_subscriber::fmt` Layer outputting to stdout
mod fmt;

/// Logging level. A "higher level" means more will be logged.
#[derive(Default, Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq)]
pub enum Level {
    /// Off
    Off = 0,
    /// Error
    Error = 1,
    /// Warn
    Warn = 2,
    /// Info
    #[default]
    Info = 3,
    /// Debug
    Debug = 4,
    /// Trace
    Trace = 5,
}

impl std::str::FromStr for Level {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "off" => Level::Off,
            "error" => Level::Error,
            "warn" | "warning" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            other => eyre::bail!("unknown log level {other:?}"),
        })
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
        }
    }
}

/// Configuration for the tracing subscribers used by the node
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Output format
    pub fmt: Style,
    /// Maximum level
    pub level: Level,
}

impl TracingConfig {
    /// Reads `level` and `format` from the `log` section.
    pub fn from_section(section: &ValueParser, err: &mut ConfigParsingError) -> Self {
        let level = section
            .string(err, "level")
            .and_then(|s| {
                let path = format!("{}.level", section.path());
                err.take(&path, s.parse())
            })
            .unwrap_or_default();
        let fmt = section
            .string(err, "format")
            .and_then(|s| {
                let path = format!("{}.format", section.path());
                err.take(&path, s.parse())
            })
            .unwrap_or_default();
        Self { fmt, level }
    }

    /// Attempt to instantiate and register a tracing subscriber setup from
    /// settings.
    pub fn start_tracing(&self) -> Result<()> {
        let mut target_layer = Targets::new().with_default(self.level);
        if self.level < Level::Trace {
            // only show these debug and trace logs at trace level
            target_layer = target_layer.with_target("hyper", Level::Info);
            target_layer = target_layer.with_target("reqwest", Level::Info);
            target_layer = target_layer.with_target("tungstenite", Level::Info);
            target_layer = target_layer.with_target("ethers_providers", Level::Info);

            // only show sqlx query logs at trace level
            target_layer = target_layer.with_target("sqlx::query", Level::Warn);
            target_layer = target_layer.with_target("sea_orm", Level::Info);
        }
        let err_layer = tracing_error::ErrorLayer::default();

        let subscriber = tracing_subscriber::Registry::default()
            .with(target_layer)
            .with(self.fmt.layer())
            .with(err_layer);

        subscriber.try_init()?;
        Ok(())
    }
}
