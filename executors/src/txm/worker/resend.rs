use serde::{Deserialize, Serialize};
use txm_core::{
    chain::Chain, fees::FeeEstimator, signer::AttemptSigner, transaction::OperationState,
};

use crate::txm::{
    error_classifier::BroadcastVerdict,
    store::TxStore,
    worker::{TxmWorker, error::TxmWorkerError, live_attempt},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendReport {
    pub rebroadcast: u32,
    pub accepted: u32,
}

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    // ========== RESEND FLOW ==========
    /// Rebroadcasts the live attempt of every in-flight operation.
    ///
    /// Only records what the nodes said. Nonce and fee state belong to the broadcaster and
    /// the confirmer.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain_id))]
    pub async fn resend_pass(&self) -> Result<ResendReport, TxmWorkerError> {
        let mut report = ResendReport::default();

        for op in self
            .store
            .operations_in_state(OperationState::InFlight)
            .await?
        {
            if self.shutdown.is_cancelled() {
                break;
            }

            let attempts = self.store.get_attempts(&op.id).await?;
            let Some(live) = live_attempt(&attempts) else {
                continue;
            };

            let verdict = self.broadcast_attempt(live).await?;
            report.rebroadcast += 1;
            if verdict == BroadcastVerdict::Accepted {
                report.accepted += 1;
            } else {
                tracing::debug!(operation_id = %op.id, hash = %live.hash, verdict = ?verdict, "Rebroadcast not accepted");
            }
        }

        if report.rebroadcast > 0 {
            tracing::debug!(
                rebroadcast = report.rebroadcast,
                accepted = report.accepted,
                "Resend pass finished"
            );
        }

        Ok(report)
    }

    /// Crash recovery run once at start: in-flight attempts that no node ever accepted may
    /// have been persisted without being sent, so they go through the full send loop.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain_id))]
    pub async fn recover_unsent(&self) -> Result<u32, TxmWorkerError> {
        let mut recovered = 0;

        for op in self
            .store
            .operations_in_state(OperationState::InFlight)
            .await?
        {
            let attempts = self.store.get_attempts(&op.id).await?;
            let Some(live) = live_attempt(&attempts) else {
                continue;
            };
            if live.was_accepted() {
                continue;
            }

            tracing::info!(operation_id = %op.id, nonce = live.nonce, hash = %live.hash, "Sending attempt persisted before restart");
            self.send_until_settled(&op.id, live.clone(), false).await?;
            recovered += 1;
        }

        Ok(recovered)
    }
}
