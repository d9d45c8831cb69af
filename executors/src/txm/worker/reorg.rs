use txm_core::{
    chain::Chain,
    fees::FeeEstimator,
    heads::Head,
    signer::AttemptSigner,
    transaction::{AttemptState, Operation, OperationState},
};

use crate::txm::{
    store::{OperationUpdate, TransactionStoreError, TxStore},
    worker::{TxmWorker, error::TxmWorkerError},
};

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    // ========== REORG FLOW ==========
    /// Re-verifies the receipt block of every confirmed, not yet finalized operation and
    /// reopens the ones whose block left the canonical chain. Returns how many were reopened.
    ///
    /// Caller holds the confirm lock. Running it twice for the same head changes nothing
    /// the second time.
    pub(crate) async fn reconcile_reorgs(&self, head: Head) -> Result<u32, TxmWorkerError> {
        let confirmed = self
            .store
            .operations_in_state(OperationState::Confirmed)
            .await?;

        let mut reopened = 0;
        for op in confirmed {
            let Some(receipt) = op.receipt.clone() else {
                continue;
            };

            let canonical = match self.chain.block_hash(receipt.block_number).await {
                Ok(canonical) => canonical,
                Err(e) => {
                    tracing::warn!(
                        operation_id = %op.id,
                        block = receipt.block_number,
                        error = %e,
                        "Block hash lookup failed, skipping reorg check for this head"
                    );
                    continue;
                }
            };

            if canonical == Some(receipt.block_hash) {
                continue;
            }

            tracing::warn!(
                operation_id = %op.id,
                block = receipt.block_number,
                receipt_block_hash = %receipt.block_hash,
                canonical_block_hash = ?canonical,
                "Confirmed block is no longer canonical, reopening operation"
            );

            if self.reopen(op, head).await? {
                reopened += 1;
            }
        }

        Ok(reopened)
    }

    /// Moves a confirmed operation back to in-flight and rebroadcasts its included attempt.
    async fn reopen(&self, mut op: Operation, head: Head) -> Result<bool, TxmWorkerError> {
        let attempts = self.store.get_attempts(&op.id).await?;

        let restored: Vec<_> = attempts
            .into_iter()
            .filter_map(|mut attempt| {
                match attempt.state {
                    AttemptState::Included => {
                        attempt.state = AttemptState::Active;
                        attempt.receipt = None;
                        attempt.broadcast_block = Some(head.number);
                    }
                    AttemptState::Dead => attempt.state = AttemptState::Superseded,
                    AttemptState::Active | AttemptState::Superseded => return None,
                }
                Some(attempt)
            })
            .collect();

        op.state = OperationState::InFlight;
        op.receipt = None;
        op.reverted = false;
        op.updated_at = Self::now();

        let update = OperationUpdate::new(op, OperationState::Confirmed)
            .with_attempts(restored.iter().cloned());

        match self.store.commit(update).await {
            Ok(()) => {}
            Err(TransactionStoreError::StateConflict { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Some(live) = restored
            .iter()
            .find(|attempt| attempt.state == AttemptState::Active)
        {
            let verdict = self.broadcast_attempt(live).await?;
            tracing::debug!(hash = %live.hash, verdict = ?verdict, "Rebroadcast reopened attempt");
        }

        Ok(true)
    }
}
