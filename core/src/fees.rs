use alloy::{
    providers::{Provider, ProviderBuilder, RootProvider},
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::{AlloyRpcErrorToEngineError, EngineError},
    transaction::FeeParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    /// Used when a node already told us the quote was too low.
    High,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum FeeError {
    #[error("fee cap of {cap} wei reached")]
    CapReached { cap: u128 },

    #[error("fee estimation failed: {0}")]
    Estimation(EngineError),
}

/// Source of fee parameters for new and replacement attempts.
///
/// `bump` must return fees strictly above `previous` in both components, or
/// [`FeeError::CapReached`] once that is no longer possible.
pub trait FeeEstimator: Send + Sync + 'static {
    fn quote(&self, urgency: Urgency) -> impl Future<Output = Result<FeeParams, FeeError>> + Send;

    fn bump(&self, previous: &FeeParams)
    -> impl Future<Output = Result<FeeParams, FeeError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// e.g. 120 for a 20% increase per bump
    pub bump_percent: u32,
    pub price_max_wei: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            bump_percent: 120,
            price_max_wei: 5_000_000_000_000, // 5000 gwei
        }
    }
}

fn scale(value: u128, percent: u32) -> u128 {
    value.saturating_mul(percent as u128) / 100
}

/// Clamps a quote so neither component exceeds `cap` and the tip never exceeds the max fee.
pub fn clamp_fee(fee: FeeParams, cap: u128) -> FeeParams {
    let max_fee_per_gas = fee.max_fee_per_gas.min(cap);
    FeeParams {
        max_fee_per_gas,
        max_priority_fee_per_gas: fee.max_priority_fee_per_gas.min(max_fee_per_gas),
    }
}

/// Raises both components by `percent` (at least by one wei each), capped at `cap`.
pub fn bump_fee(previous: &FeeParams, percent: u32, cap: u128) -> Result<FeeParams, FeeError> {
    let raised = FeeParams {
        max_fee_per_gas: scale(previous.max_fee_per_gas, percent)
            .max(previous.max_fee_per_gas.saturating_add(1)),
        max_priority_fee_per_gas: scale(previous.max_priority_fee_per_gas, percent)
            .max(previous.max_priority_fee_per_gas.saturating_add(1)),
    };

    let next = clamp_fee(raised, cap);
    if next.is_strictly_above(previous) {
        Ok(next)
    } else {
        Err(FeeError::CapReached { cap })
    }
}

/// Quotes from the node's `eth_feeHistory` based EIP-1559 estimate.
#[derive(Clone)]
pub struct ProviderFeeEstimator {
    chain_id: u64,
    rpc_url: Url,
    provider: RootProvider,
    config: FeeConfig,
}

impl ProviderFeeEstimator {
    pub fn new(chain_id: u64, rpc_url: &str, config: FeeConfig) -> Result<Self, EngineError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| EngineError::RpcConfigError {
            message: format!("Failed to parse fee estimator RPC URL: {e}"),
        })?;

        Ok(Self {
            chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
            config,
        })
    }

    fn cap(&self) -> u128 {
        self.config.price_max_wei as u128
    }
}

impl FeeEstimator for ProviderFeeEstimator {
    async fn quote(&self, urgency: Urgency) -> Result<FeeParams, FeeError> {
        let estimate = self.provider.estimate_eip1559_fees().await.map_err(|e| {
            FeeError::Estimation(e.to_engine_error(self.chain_id, self.rpc_url.as_str()))
        })?;

        tracing::debug!(
            chain_id = self.chain_id,
            max_fee = estimate.max_fee_per_gas,
            max_priority_fee = estimate.max_priority_fee_per_gas,
            "Using EIP-1559 fees"
        );

        let quote = FeeParams::new(estimate.max_fee_per_gas, estimate.max_priority_fee_per_gas);
        match urgency {
            Urgency::Normal => Ok(clamp_fee(quote, self.cap())),
            Urgency::High => bump_fee(&quote, self.config.bump_percent, self.cap()),
        }
    }

    async fn bump(&self, previous: &FeeParams) -> Result<FeeParams, FeeError> {
        bump_fee(previous, self.config.bump_percent, self.cap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_raises_both_components_by_percent() {
        let next = bump_fee(&FeeParams::new(100, 10), 120, 1_000).unwrap();
        assert_eq!(next, FeeParams::new(120, 12));
    }

    #[test]
    fn bump_moves_tiny_fees_by_at_least_one_wei() {
        let next = bump_fee(&FeeParams::new(1, 1), 120, 1_000).unwrap();
        assert_eq!(next, FeeParams::new(2, 2));
    }

    #[test]
    fn bump_is_capped_then_exhausted() {
        let capped = bump_fee(&FeeParams::new(900, 10), 120, 1_000).unwrap();
        assert_eq!(capped, FeeParams::new(1_000, 12));

        let err = bump_fee(&capped, 120, 1_000).unwrap_err();
        assert_eq!(err, FeeError::CapReached { cap: 1_000 });
    }

    #[test]
    fn tip_can_not_exceed_max_fee() {
        let fee = clamp_fee(FeeParams::new(5_000, 4_000), 1_000);
        assert_eq!(fee, FeeParams::new(1_000, 1_000));
    }
}
