use std::time::Duration;

use oracle_base::settings::{ConfigParsingError, ValueParser};
use oracle_core::U256;

const GWEI: u64 = 1_000_000_000;

/// Tunables of the transaction manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxmConfig {
    /// Chain the signatures commit to
    pub chain_id: u64,
    /// Confirmed txs are re-checked for reorgs while within this depth
    pub finality_depth: u64,
    /// Blocks on top of the receipt block before a tx is confirmed
    pub min_confirmations: u64,
    /// Blocks without a receipt before the gas price is bumped, 0 disables
    pub gas_bump_threshold: u64,
    /// Relative bump
    pub gas_bump_percent: u64,
    /// Absolute minimum bump
    pub gas_bump_wei: U256,
    /// Floor of any gas price
    pub min_gas_price_wei: U256,
    /// Cap of any gas price
    pub max_gas_price_wei: U256,
    /// Price of first attempts
    pub gas_price_default: U256,
    /// Gas limit when the request has none
    pub gas_limit_default: u64,
    /// Unconfirmed txs per address before broadcasting pauses
    pub max_in_flight_transactions: u64,
    /// Unstarted txs per address before enqueue fails, 0 is unlimited
    pub max_queued_transactions: u64,
    /// Unmined attempts are resent after this long
    pub resend_after_threshold: Duration,
    /// First delay after a transient send failure
    pub retry_backoff: Duration,
    /// Cap of the send retry delay
    pub max_retry_backoff: Duration,
    /// Fallback wake up of idle broadcasters
    pub poll_interval: Duration,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            finality_depth: 50,
            min_confirmations: 12,
            gas_bump_threshold: 3,
            gas_bump_percent: 20,
            gas_bump_wei: U256::from(5 * GWEI),
            min_gas_price_wei: U256::from(GWEI),
            max_gas_price_wei: U256::from(5000 * GWEI),
            gas_price_default: U256::from(20 * GWEI),
            gas_limit_default: 500_000,
            max_in_flight_transactions: 16,
            max_queued_transactions: 250,
            resend_after_threshold: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl TxmConfig {
    /// Reads the `txm` section. Chain id and finality depth come from the
    /// chain settings and are set by the caller.
    pub fn from_section(section: &ValueParser, err: &mut ConfigParsingError) -> Self {
        let d = Self::default();
        let config = Self {
            chain_id: d.chain_id,
            finality_depth: d.finality_depth,
            min_confirmations: section
                .u64(err, "minConfirmations")
                .unwrap_or(d.min_confirmations),
            gas_bump_threshold: section
                .u64(err, "gasBumpThreshold")
                .unwrap_or(d.gas_bump_threshold),
            gas_bump_percent: section
                .u64(err, "gasBumpPercent")
                .unwrap_or(d.gas_bump_percent),
            gas_bump_wei: section.wei_or(err, "gasBumpWei", d.gas_bump_wei),
            min_gas_price_wei: section.wei_or(err, "minGasPriceWei", d.min_gas_price_wei),
            max_gas_price_wei: section.wei_or(err, "maxGasPriceWei", d.max_gas_price_wei),
            gas_price_default: section.wei_or(err, "gasPriceDefault", d.gas_price_default),
            gas_limit_default: section
                .u64(err, "gasLimitDefault")
                .unwrap_or(d.gas_limit_default),
            max_in_flight_transactions: section
                .u64(err, "maxInFlightTransactions")
                .unwrap_or(d.max_in_flight_transactions),
            max_queued_transactions: section
                .u64(err, "maxQueuedTransactions")
                .unwrap_or(d.max_queued_transactions),
            resend_after_threshold: section.duration_or(
                err,
                "ethTxResendAfterThreshold",
                d.resend_after_threshold,
            ),
            retry_backoff: d.retry_backoff,
            max_retry_backoff: d.max_retry_backoff,
            poll_interval: section.duration_or(err, "pollInterval", d.poll_interval),
        };
        if config.min_gas_price_wei > config.max_gas_price_wei {
            err.push(
                format!("{}.minGasPriceWei", section.path()),
                eyre::eyre!("must not exceed maxGasPriceWei"),
            );
        }
        if config.max_in_flight_transactions == 0 {
            err.push(
                format!("{}.maxInFlightTransactions", section.path()),
                eyre::eyre!("must be at least 1"),
            );
        }
        config
    }
}
