use prometheus::{
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry, HistogramVec,
    IntCounter, IntCounterVec, Registry,
};

const METRICS_NAMESPACE: &str = "oracle_pipeline";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics of the pipeline runner
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    /// Runs created
    pub runs_started: IntCounter,
    /// Finished runs, labelled by `state`
    pub run_outcomes: IntCounterVec,
    /// Task wall time in seconds, labelled by `task_type`
    pub task_duration: HistogramVec,
    /// Errored tasks, labelled by `task_type`
    pub task_errors: IntCounterVec,
    /// Tasks that suspended the run
    pub suspensions: IntCounter,
}

impl PipelineMetrics {
    /// Registers the metrics on `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            runs_started: register_int_counter_with_registry!(
                opts!(namespaced("runs_started_total"), "Pipeline runs created"),
                registry
            )?,
            run_outcomes: register_int_counter_vec_with_registry!(
                opts!(
                    namespaced("runs_finished_total"),
                    "Finished pipeline runs by final state"
                ),
                &["state"],
                registry
            )?,
            task_duration: register_histogram_vec_with_registry!(
                histogram_opts!(
                    namespaced("task_duration_seconds"),
                    "Wall time of task executions",
                    vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 600.0]
                ),
                &["task_type"],
                registry
            )?,
            task_errors: register_int_counter_vec_with_registry!(
                opts!(namespaced("task_errors_total"), "Errored task executions"),
                &["task_type"],
                registry
            )?,
            suspensions: register_int_counter_with_registry!(
                opts!(
                    namespaced("suspensions_total"),
                    "Tasks waiting for an external result"
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
