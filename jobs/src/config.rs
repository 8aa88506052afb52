use std::time::Duration;

use oracle_base::settings::{ConfigParsingError, ValueParser, DEFAULT_FINALITY_DEPTH};

/// Tunables of the job spawner and its delegates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Blocks after which a block is final; the default number of
    /// confirmations a direct request waits for
    pub finality_depth: u64,
    /// How often runs missed by their trigger are looked for
    pub trigger_fallback_db_poll_interval: Duration,
    /// How long deleting a job waits for its running runs
    pub drain_timeout: Duration,
    /// Delay before a lost log subscription is re-established
    pub resubscribe_backoff: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            finality_depth: DEFAULT_FINALITY_DEPTH,
            trigger_fallback_db_poll_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

impl JobsConfig {
    /// Reads the `jobs` section. The finality depth comes from the chain
    /// settings.
    pub fn from_section(
        section: &ValueParser,
        finality_depth: u64,
        err: &mut ConfigParsingError,
    ) -> Self {
        let d = Self::default();
        let config = Self {
            finality_depth,
            trigger_fallback_db_poll_interval: section.duration_or(
                err,
                "triggerFallbackDbPollInterval",
                d.trigger_fallback_db_poll_interval,
            ),
            drain_timeout: section.duration_or(err, "drainTimeout", d.drain_timeout),
            resubscribe_backoff: section.duration_or(
                err,
                "resubscribeBackoff",
                d.resubscribe_backoff,
            ),
        };
        if config.trigger_fallback_db_poll_interval.is_zero() {
            err.push(
                format!("{}.triggerFallbackDbPollInterval", section.path()),
                eyre::eyre!("must be positive"),
            );
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let raw = json!({"jobs": {"trigger_fallback_db_poll_interval": "5s"}});
        let mut err = ConfigParsingError::default();
        let config = JobsConfig::from_section(&ValueParser::new(&raw).section("jobs"), 12, &mut err);
        assert!(err.is_ok());
        assert_eq!(config.finality_depth, 12);
        assert_eq!(config.trigger_fallback_db_poll_interval, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let raw = json!({"jobs": {"triggerFallbackDbPollInterval": "0s"}});
        let mut err = ConfigParsingError::default();
        JobsConfig::from_section(&ValueParser::new(&raw).section("jobs"), 50, &mut err);
        assert!(err.to_string().contains("jobs.triggerFallbackDbPollInterval"));
    }
}
