use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

const METRICS_NAMESPACE: &str = "oracle_jobs";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics of the job spawner and its delegates
#[derive(Clone, Debug)]
pub struct JobMetrics {
    /// Jobs with running services
    pub active_jobs: IntGauge,
    /// Runs started by a trigger, labelled by `job_type`
    pub runs_triggered: IntCounterVec,
    /// Oracle request logs ignored, labelled by `reason`
    pub logs_dropped: IntCounterVec,
    /// Runs errored because their request log was reorged away
    pub runs_abandoned: IntCounter,
}

impl JobMetrics {
    /// Registers the metrics on `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            active_jobs: register_int_gauge_with_registry!(
                opts!(namespaced("active"), "Jobs with running services"),
                registry
            )?,
            runs_triggered: register_int_counter_vec_with_registry!(
                opts!(
                    namespaced("runs_triggered_total"),
                    "Pipeline runs started by job triggers"
                ),
                &["job_type"],
                registry
            )?,
            logs_dropped: register_int_counter_vec_with_registry!(
                opts!(
                    namespaced("request_logs_dropped_total"),
                    "Oracle request logs that did not start a run"
                ),
                &["reason"],
                registry
            )?,
            runs_abandoned: register_int_counter_with_registry!(
                opts!(
                    namespaced("runs_abandoned_total"),
                    "Runs errored after their request log was reorged away"
                ),
                registry
            )?,
        })
    }

    /// Metrics on a throwaway registry, for tests.
    pub fn dummy_instance() -> Self {
        #[allow(clippy::unwrap_used)]
        Self::new(&Registry::new()).unwrap()
    }
}
