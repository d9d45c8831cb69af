use std::time::Duration;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// Per-chain manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxmConfig {
    /// Keys enabled at start
    pub keys: Vec<Address>,
    /// Cap on unstarted + in-flight operations per key
    pub max_in_flight: u64,
    /// Cap on unstarted operations per key
    pub max_queued: u64,
    /// Blocks without a receipt before an attempt is bumped
    pub bump_threshold: u64,
    pub max_bump_depth: u32,
    pub default_gas_limit: u64,
    /// Confirmed operations this deep become finalized, shallower ones are re-checked for reorgs
    pub finality_depth: u64,
    pub nonce_sync_tolerance: u64,
    pub broadcast_poll_ms: u64,
    pub resend_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub reap_retention_secs: u64,
    pub head_buffer: usize,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            max_in_flight: 16,
            max_queued: 250,
            bump_threshold: 3,
            max_bump_depth: 10,
            default_gas_limit: 500_000,
            finality_depth: 50,
            nonce_sync_tolerance: 0,
            broadcast_poll_ms: 1_000,
            resend_interval_ms: 30_000,
            reap_interval_ms: 3_600_000,
            reap_retention_secs: 604_800,
            head_buffer: 16,
        }
    }
}

impl TxmConfig {
    pub fn broadcast_poll_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_poll_ms.max(1))
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn reap_retention_ms(&self) -> u64 {
        self.reap_retention_secs.saturating_mul(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: TxmConfig = serde_json::from_str(r#"{"max_in_flight": 2}"#).unwrap();

        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.max_queued, 250);
        assert_eq!(config.bump_threshold, 3);
        assert_eq!(config.finality_depth, 50);
        assert_eq!(config.reap_retention_ms(), 604_800_000);
        assert!(config.keys.is_empty());
    }
}
