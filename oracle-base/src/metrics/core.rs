use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use eyre::Result;
use prometheus::{
    histogram_opts, labels, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

/// Macro to prefix a string with the namespace.
macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", super::NAMESPACE, $name)
    };
}

/// Process wide metrics registry plus the gauges every subsystem shares.
pub struct CoreMetrics {
    /// Metrics registry for adding new metrics and gathering reports
    registry: Registry,
    const_labels: HashMap<String, String>,
    listen_port: u16,
    agent_name: String,

    sending_key_balance: IntGaugeVec,
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    ///
    /// - `for_agent` name of the agent these metrics are tracking.
    /// - `listen_port` port the HTTP server serves `/metrics` on.
    /// - `registry` prometheus registry to attach the metrics to
    pub fn new(for_agent: &str, listen_port: u16, registry: Registry) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            namespaced!("baselib_version") => env!("CARGO_PKG_VERSION").into(),
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let sending_key_balance = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("sending_key_balance_gwei"),
                "Balance of each sending key in gwei, sampled on new heads",
                const_labels_ref
            ),
            &["address"],
            registry
        )?;

        Ok(Self {
            registry,
            const_labels,
            listen_port,
            agent_name: for_agent.into(),
            sending_key_balance,
        })
    }

    /// Registry to attach subsystem metrics to.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Create and register a new int gauge.
    pub fn new_int_gauge(
        &self,
        metric_name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntGaugeVec> {
        Ok(register_int_gauge_vec_with_registry!(
            opts!(namespaced!(metric_name), help, self.const_labels_str()),
            labels,
            self.registry
        )?)
    }

    /// Create and register a new int counter.
    pub fn new_int_counter(
        &self,
        metric_name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<IntCounterVec> {
        Ok(register_int_counter_vec_with_registry!(
            opts!(namespaced!(metric_name), help, self.const_labels_str()),
            labels,
            self.registry
        )?)
    }

    /// Create and register a new histogram.
    pub fn new_histogram(
        &self,
        metric_name: &str,
        help: &str,
        labels: &[&str],
        buckets: Vec<f64>,
    ) -> Result<HistogramVec> {
        Ok(register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!(metric_name),
                help,
                buckets,
                self.const_labels.clone()
            ),
            labels,
            self.registry
        )?)
    }

    /// Balance of each sending key in gwei.
    ///
    /// Labels:
    /// - `address`: the sending address.
    pub fn sending_key_balance(&self) -> IntGaugeVec {
        self.sending_key_balance.clone()
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    /// Get the name of this agent, e.g. "oracle-node"
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    fn const_labels_str(&self) -> HashMap<&str, &str> {
        self.const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Metrics on a throwaway registry, for tests.
    pub fn dummy_instance() -> Self {
        #[allow(clippy::unwrap_used)]
        Self::new("test", 0, Registry::new()).unwrap()
    }
}

impl Debug for CoreMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CoreMetrics {{ agent_name: {}, listen_port: {:?} }}",
            self.agent_name, self.listen_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystems_own_their_health_gauges() {
        let metrics = CoreMetrics::dummy_instance();
        let health = metrics
            .new_int_gauge("chain_health", "head subscription health", &[])
            .unwrap();
        health.with_label_values(&[]).set(1);
        metrics
            .sending_key_balance()
            .with_label_values(&["0xab"])
            .set(7);

        let report = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert_eq!(report.matches("# TYPE oracle_chain_health").count(), 1);
        assert!(report.contains("oracle_sending_key_balance_gwei"));
    }
}
