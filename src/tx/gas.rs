//! Gas price escalation and gas limit selection

use ethers::types::U256;

/// Gas settings for submissions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Fixed gas limit from network config; estimated per call when unset
    gas_limit: Option<U256>,
    /// Buffer percentage on top of an estimated gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new(gas_limit: Option<u64>) -> Self {
        Self {
            gas_limit: gas_limit.map(U256::from),
            gas_limit_buffer_percent: 20,
        }
    }

    pub fn fixed_gas_limit(&self) -> Option<U256> {
        self.gas_limit
    }

    /// Add the safety buffer to a node estimate
    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Price for attempt `attempt` (1-based): base, then 2x, 3x, ...
    ///
    /// A resubmission reuses its nonce, so it has to outbid the copy that may
    /// still sit in the mempool.
    pub fn escalated_price(base: U256, attempt: u32) -> U256 {
        base.saturating_mul(U256::from(attempt.max(1)))
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalated_price_is_linear_in_attempt() {
        let base = U256::from(30_000_000_000u64);
        let prices: Vec<U256> = (1..=4).map(|a| GasEstimator::escalated_price(base, a)).collect();
        assert_eq!(
            prices,
            vec![base, base * 2, base * 3, base * 4]
        );
        assert!(prices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_buffered_limit() {
        let gas = GasEstimator::default();
        assert_eq!(gas.buffered_limit(U256::from(100_000)), U256::from(120_000));
        assert_eq!(gas.fixed_gas_limit(), None);
        assert_eq!(
            GasEstimator::new(Some(250_000)).fixed_gas_limit(),
            Some(U256::from(250_000))
        );
    }
}
