use serde::{Deserialize, Serialize};
use txm_core::{
    chain::Chain, fees::FeeEstimator, signer::AttemptSigner, transaction::OperationState,
};

use crate::txm::{
    store::TxStore,
    worker::{TxmWorker, error::TxmWorkerError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub confirmed: u32,
    pub finalized: u32,
    pub failed: u32,
}

impl ReapReport {
    pub fn total(&self) -> u32 {
        self.confirmed + self.finalized + self.failed
    }
}

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    // ========== REAP FLOW ==========
    /// Deletes terminal operations whose last transition is older than the retention window.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain_id))]
    pub async fn reap_pass(&self) -> Result<ReapReport, TxmWorkerError> {
        let cutoff = Self::now().saturating_sub(self.config.reap_retention_ms());
        let mut report = ReapReport::default();

        for state in OperationState::ALL.into_iter().filter(|s| s.is_reapable()) {
            let expired = self.store.operations_updated_before(state, cutoff).await?;

            for op in expired {
                if !self.store.delete_operation(&op.id, state).await? {
                    continue;
                }

                match state {
                    OperationState::Confirmed => report.confirmed += 1,
                    OperationState::Finalized => report.finalized += 1,
                    _ => report.failed += 1,
                }
            }
        }

        if report.total() > 0 {
            tracing::info!(
                confirmed = report.confirmed,
                finalized = report.finalized,
                failed = report.failed,
                cutoff,
                "Reaped expired operations"
            );
        }

        Ok(report)
    }
}
