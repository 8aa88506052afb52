use std::time::Duration;

use oracle_base::settings::{ConfigParsingError, ValueParser};

/// Tunables of the pipeline runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Wall time a single task may take, unless the pipeline overrides it
    pub max_task_duration: Duration,
    /// Timeout of one http or bridge request
    pub default_http_timeout: Duration,
    /// Attempts of an http request failing at the transport level
    pub http_max_attempts: u32,
    /// Bodies larger than this are rejected
    pub http_max_response_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_task_duration: Duration::from_secs(600),
            default_http_timeout: Duration::from_secs(15),
            http_max_attempts: 3,
            http_max_response_bytes: 1 << 20,
        }
    }
}

impl RunnerConfig {
    /// Reads the `pipeline` section.
    pub fn from_section(section: &ValueParser, err: &mut ConfigParsingError) -> Self {
        let d = Self::default();
        let config = Self {
            max_task_duration: section.duration_or(
                err,
                "jobPipelineMaxRunDuration",
                d.max_task_duration,
            ),
            default_http_timeout: section.duration_or(
                err,
                "defaultHttpTimeout",
                d.default_http_timeout,
            ),
            http_max_attempts: section
                .u64(err, "httpMaxAttempts")
                .map(|n| n.clamp(1, 10) as u32)
                .unwrap_or(d.http_max_attempts),
            http_max_response_bytes: section
                .u64(err, "httpMaxResponseBytes")
                .map(|n| n as usize)
                .unwrap_or(d.http_max_response_bytes),
        };
        if config.max_task_duration.is_zero() {
            err.push(
                format!("{}.jobPipelineMaxRunDuration", section.path()),
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
    fn reads_durations() {
        let raw = json!({"pipeline": {"jobPipelineMaxRunDuration": "30s", "default_http_timeout": "2s"}});
        let mut err = ConfigParsingError::default();
        let config =
            RunnerConfig::from_section(&ValueParser::new(&raw).section("pipeline"), &mut err);
        assert!(err.is_ok());
        assert_eq!(config.max_task_duration, Duration::from_secs(30));
        assert_eq!(config.default_http_timeout, Duration::from_secs(2));
        assert_eq!(config.http_max_attempts, 3);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let raw = json!({"pipeline": {"jobPipelineMaxRunDuration": "0s"}});
        let mut err = ConfigParsingError::default();
        RunnerConfig::from_section(&ValueParser::new(&raw).section("pipeline"), &mut err);
        assert!(err.to_string().contains("pipeline.jobPipelineMaxRunDuration"));
    }
}
