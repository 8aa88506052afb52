use prometheus::{
    opts, register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter,
    IntGauge, Registry,
};

const METRICS_NAMESPACE: &str = "oracle_head_tracker";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics of the head tracker and broadcaster
#[derive(Clone, Debug)]
pub struct HeadTrackerMetrics {
    /// Heads received from the subscription or fetched while backfilling
    pub heads_received: IntCounter,
    /// Number of the current longest chain
    pub current_head: IntGauge,
    /// Reorgs observed
    pub reorgs: IntCounter,
    /// Heads dropped because the input buffer was full
    pub dropped_heads: IntCounter,
    /// Subscriber callbacks that ran past their timeout
    pub callback_timeouts: IntCounter,
    /// 1 while the head subscription is live
    pub chain_health: IntGauge,
}

impl HeadTrackerMetrics {
    /// Registers the metrics on `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            heads_received: register_int_counter_with_registry!(
                opts!(namespaced("heads_received_total"), "Heads received"),
                registry
            )?,
            current_head: register_int_gauge_with_registry!(
                opts!(
                    namespaced("current_head"),
                    "Block number of the current longest chain"
                ),
                registry
            )?,
            reorgs: register_int_counter_with_registry!(
                opts!(namespaced("reorgs_total"), "Reorgs observed"),
                registry
            )?,
            dropped_heads: register_int_counter_with_registry!(
                opts!(
                    namespaced("dropped_heads_total"),
                    "Heads dropped from the full input buffer"
                ),
                registry
            )?,
            callback_timeouts: register_int_counter_with_registry!(
                opts!(
                    namespaced("callback_timeouts_total"),
                    "Head callbacks that exceeded their timeout"
                ),
                registry
            )?,
            chain_health: register_int_gauge_with_registry!(
                opts!(
                    namespaced("chain_health"),
                    "1 while the head subscription is live"
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
