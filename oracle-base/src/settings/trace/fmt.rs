use tracing::Subscriber;
use tracing_subscriber::{registry::LookupSpan, Layer};

/// Basic tracing configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Style {
    /// Pretty print
    Pretty,
    /// JSON
    Json,
    /// Compact
    Compact,
    /// Default style
    #[default]
    Full,
}

impl std::str::FromStr for Style {
    type Err = eyre::Report;

    fn from_str(s: &str) -> eyre::Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "pretty" => Style::Pretty,
            "json" => Style::Json,
            "compact" => Style::Compact,
            "full" => Style::Full,
            other => eyre::bail!("unknown log format {other:?}"),
        })
    }
}

impl Style {
    /// The stdout layer for this style.
    pub fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = tracing_subscriber::fmt::layer().with_target(true);
        match self {
            Style::Pretty => layer.pretty().boxed(),
            Style::Json => layer.json().boxed(),
            Style::Compact => layer.compact().boxed(),
            Style::Full => layer.boxed(),
        }
    }
}
