use prometheus::{
    opts, register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

const METRICS_NAMESPACE: &str = "oracle_txm";

fn namespaced(name: &str) -> String {
    format!("{}_{}", METRICS_NAMESPACE, name)
}

/// Metrics of the transaction manager
#[derive(Clone, Debug)]
pub struct TxmMetrics {
    /// Txs accepted by enqueue
    pub txs_enqueued: IntCounter,
    /// Transitions into each tx state, labelled by `state`
    pub tx_transitions: IntCounterVec,
    /// Attempts the node accepted
    pub attempts_broadcast: IntCounter,
    /// Bumped attempts created
    pub gas_bumps: IntCounter,
    /// Bumps skipped because the price is at the cap
    pub gas_cap_reached: IntCounter,
    /// Confirmed txs returned to unconfirmed by a reorg
    pub reorged_txs: IntCounter,
    /// Unmined attempts sent again
    pub resends: IntCounter,
    /// Send failures, labelled by `class`
    pub send_errors: IntCounterVec,
    /// Next nonce per address
    pub next_nonce: IntGaugeVec,
}

impl TxmMetrics {
    /// Registers the metrics on `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            txs_enqueued: register_int_counter_with_registry!(
                opts!(namespaced("txs_enqueued_total"), "Transactions enqueued"),
                registry
            )?,
            tx_transitions: register_int_counter_vec_with_registry!(
                opts!(
                    namespaced("tx_transitions_total"),
                    "Transactions entering each state"
                ),
                &["state"],
                registry
            )?,
            attempts_broadcast: register_int_counter_with_registry!(
                opts!(
                    namespaced("attempts_broadcast_total"),
                    "Attempts accepted by the node"
                ),
                registry
            )?,
            gas_bumps: register_int_counter_with_registry!(
                opts!(namespaced("gas_bumps_total"), "Bumped attempts created"),
                registry
            )?,
            gas_cap_reached: register_int_counter_with_registry!(
                opts!(
                    namespaced("gas_cap_reached_total"),
                    "Bumps skipped at the gas price cap"
                ),
                registry
            )?,
            reorged_txs: register_int_counter_with_registry!(
                opts!(
                    namespaced("reorged_txs_total"),
                    "Confirmed transactions undone by a reorg"
                ),
                registry
            )?,
            resends: register_int_counter_with_registry!(
                opts!(namespaced("resends_total"), "Unmined attempts resent"),
                registry
            )?,
            send_errors: register_int_counter_vec_with_registry!(
                opts!(namespaced("send_errors_total"), "Failed sends by class"),
                &["class"],
                registry
            )?,
            next_nonce: register_int_gauge_vec_with_registry!(
                opts!(namespaced("next_nonce"), "Next nonce of each sending key"),
                &["address"],
                registry
            )?,
        })
    }

    /// Metrics on a throwaway registry, for tests.
    pub fn dummy_instance() -> Self {
        #[allow(clippy::unwrap_used)]
        Self::new(&Registry::new()).unwrap()
    }

    pub(crate) fn transition(&self, state: crate::EthTxState) {
        self.tx_transitions
            .with_label_values(&[state.as_ref()])
            .inc();
    }
}
