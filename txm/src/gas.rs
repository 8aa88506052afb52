use oracle_core::U256;

use crate::TxmConfig;

/// Price of a first attempt: the default clamped into `[min, max]`.
pub fn initial_gas_price(config: &TxmConfig) -> U256 {
    config
        .gas_price_default
        .max(config.min_gas_price_wei)
        .min(config.max_gas_price_wei)
}

/// Price of the attempt replacing one priced at `previous`:
/// `max(previous * (1 + percent / 100), previous + bump_wei)`, capped at the
/// maximum gas price. `None` when no strictly higher price fits under the cap.
pub fn bumped_gas_price(previous: U256, config: &TxmConfig) -> Option<U256> {
    if previous >= config.max_gas_price_wei {
        return None;
    }
    let by_percent = previous.saturating_mul(U256::from(100 + config.gas_bump_percent))
        / U256::from(100);
    let by_wei = previous.saturating_add(config.gas_bump_wei);
    let bumped = by_percent.max(by_wei).min(config.max_gas_price_wei);
    (bumped > previous).then_some(bumped)
}

/// Whether an attempt first seen pending at `broadcast_before` should be
/// replaced at head `head`.
pub fn should_bump(head: u64, broadcast_before: Option<u64>, threshold: u64) -> bool {
    match broadcast_before {
        Some(seen) if threshold > 0 => head.saturating_sub(seen) >= threshold,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn initial_price_is_clamped() {
        let mut config = TxmConfig::default();
        assert_eq!(initial_gas_price(&config), gwei(20));
        config.gas_price_default = gwei(10_000);
        assert_eq!(initial_gas_price(&config), gwei(5000));
        config.gas_price_default = U256::zero();
        assert_eq!(initial_gas_price(&config), gwei(1));
    }

    #[test]
    fn bump_takes_the_larger_increase() {
        let config = TxmConfig::default();
        // 20% of 20 gwei is 4 gwei, below the 5 gwei floor
        assert_eq!(bumped_gas_price(gwei(20), &config), Some(gwei(25)));
        // 20% of 100 gwei is 20 gwei
        assert_eq!(bumped_gas_price(gwei(100), &config), Some(gwei(120)));
    }

    #[test]
    fn bump_is_capped_and_stops_at_the_cap() {
        let config = TxmConfig {
            max_gas_price_wei: gwei(22),
            ..Default::default()
        };
        assert_eq!(bumped_gas_price(gwei(20), &config), Some(gwei(22)));
        assert_eq!(bumped_gas_price(gwei(22), &config), None);
        assert_eq!(bumped_gas_price(gwei(30), &config), None);
    }

    #[test]
    fn zero_increase_is_no_bump() {
        let config = TxmConfig {
            gas_bump_percent: 0,
            gas_bump_wei: U256::zero(),
            ..Default::default()
        };
        assert_eq!(bumped_gas_price(gwei(20), &config), None);
    }

    #[test]
    fn bump_threshold_boundary() {
        assert!(!should_bump(102, Some(100), 3));
        assert!(should_bump(103, Some(100), 3));
        assert!(!should_bump(500, Some(100), 0));
        assert!(!should_bump(500, None, 3));
    }
}
