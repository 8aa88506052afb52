use std::sync::Arc;

use async_trait::async_trait;
use prometheus::IntGaugeVec;
use tracing::{info, warn};

use headtracker::HeadTrackable;
use oracle_base::CoreMetrics;
use oracle_core::{ChainClient, Head, KeyStore, U256};

/// Samples the balance of every sending key on each new head.
#[derive(Debug)]
pub struct BalanceMonitor {
    chain: Arc<dyn ChainClient>,
    keys: Arc<dyn KeyStore>,
    balance_gwei: IntGaugeVec,
}

impl BalanceMonitor {
    /// Exports balances on the `sending_key_balance` gauge of `metrics`.
    pub fn new(chain: Arc<dyn ChainClient>, keys: Arc<dyn KeyStore>, metrics: &CoreMetrics) -> Self {
        Self {
            chain,
            keys,
            balance_gwei: metrics.sending_key_balance(),
        }
    }
}

fn to_gwei(wei: U256) -> i64 {
    let gwei = wei / U256::exp10(9);
    if gwei > U256::from(i64::MAX) {
        i64::MAX
    } else {
        gwei.as_u64() as i64
    }
}

#[async_trait]
impl HeadTrackable for BalanceMonitor {
    async fn on_new_longest_chain(&self, head: &Head) {
        let keys = match self.keys.sending_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(?err, "Failed to list sending keys");
                return;
            }
        };
        for address in keys {
            match self.chain.balance_at(address, Some(head.number)).await {
                Ok(balance) => {
                    let gwei = to_gwei(balance);
                    self.balance_gwei
                        .with_label_values(&[&format!("{address:?}")])
                        .set(gwei);
                    info!(?address, %balance, block = head.number, "Sending key balance");
                }
                Err(err) => warn!(?err, ?address, "Failed to fetch balance"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use oracle_core::{Address, ChainCommunicationError, KeyStore, H256};
    use oracle_test::{
        mocks::{MockChainClient, MockKeyStore},
        test_key_store, SimulatedChain,
    };

    use super::*;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn balances_are_exported_in_gwei() {
        let chain = Arc::new(SimulatedChain::with_height(1, 2));
        let keys = Arc::new(test_key_store(2));
        let addresses = keys.sending_keys().await.unwrap();
        chain.set_balance(addresses[0], U256::from(3) * U256::exp10(9));
        let metrics = CoreMetrics::dummy_instance();
        let monitor = BalanceMonitor::new(chain.clone(), keys, &metrics);

        monitor.on_new_longest_chain(&chain.tip()).await;
        let gauge = metrics.sending_key_balance();
        assert_eq!(
            gauge
                .with_label_values(&[&format!("{:?}", addresses[0])])
                .get(),
            3
        );
        assert_eq!(
            gauge
                .with_label_values(&[&format!("{:?}", addresses[1])])
                .get(),
            1_000_000_000
        );
        assert!(logs_contain("Sending key balance"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn rpc_failures_leave_the_gauge_alone() {
        let address = Address::repeat_byte(4);
        let mut chain = MockChainClient::new();
        chain
            .expect_balance_at()
            .times(1)
            .returning(|_, _| Err(ChainCommunicationError::Transport("connection reset".into())));
        let mut keys = MockKeyStore::new();
        keys.expect_sending_keys()
            .times(1)
            .returning(move || Ok(vec![address]));
        let metrics = CoreMetrics::dummy_instance();
        let monitor = BalanceMonitor::new(Arc::new(chain), Arc::new(keys), &metrics);

        monitor
            .on_new_longest_chain(&Head::new(H256::zero(), 5, H256::zero(), chrono::Utc::now()))
            .await;
        assert!(logs_contain("Failed to fetch balance"));
        assert_eq!(
            metrics
                .sending_key_balance()
                .with_label_values(&[&format!("{address:?}")])
                .get(),
            0
        );
    }

    #[test]
    fn huge_balances_saturate() {
        assert_eq!(to_gwei(U256::MAX), i64::MAX);
    }
}
