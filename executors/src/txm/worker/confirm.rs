use futures::future::join_all;
use serde::{Deserialize, Serialize};
use txm_core::{
    chain::Chain,
    fees::{FeeEstimator, Urgency},
    heads::Head,
    signer::AttemptSigner,
    transaction::{Attempt, AttemptState, Operation, OperationState, TxReceipt},
};

use crate::txm::{
    store::{OperationUpdate, TransactionStoreError, TxStore},
    worker::{TxmWorker, error::TxmWorkerError, live_attempt},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReport {
    pub head: u64,
    pub confirmed: u32,
    pub reverted: u32,
    pub bumped: u32,
    pub finalized: u32,
    pub reopened: u32,
}

/// `depth` blocks have been built on top of `block` by `head`.
fn reached_depth(block: u64, depth: u64, head: u64) -> bool {
    head.checked_sub(block).is_some_and(|elapsed| elapsed >= depth)
}

enum ConfirmStep {
    Confirmed { reverted: bool },
    Bumped,
    Waiting,
}

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    // ========== HEAD PASS ==========
    /// Runs reorg reconciliation, confirmation and finalization for one head.
    ///
    /// Holds the chain's confirm lock for the whole pass so passes never overlap and
    /// out-of-cycle bumps wait for it.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain_id, head = head.number))]
    pub async fn process_head(&self, head: Head) -> Result<ConfirmReport, TxmWorkerError> {
        let _confirm = self.confirm_lock.lock().await;
        self.set_latest_head(head);

        let idle = ConfirmReport {
            head: head.number,
            ..Default::default()
        };
        let mut report = idle;

        report.reopened = self.reconcile_reorgs(head).await?;
        self.confirm_in_flight(head, &mut report).await?;
        report.finalized = self.finalize_confirmed(head).await?;

        if report != idle {
            tracing::info!(
                confirmed = report.confirmed,
                reverted = report.reverted,
                bumped = report.bumped,
                finalized = report.finalized,
                reopened = report.reopened,
                "Head processed"
            );
        }

        Ok(report)
    }

    async fn confirm_in_flight(
        &self,
        head: Head,
        report: &mut ConfirmReport,
    ) -> Result<(), TxmWorkerError> {
        let in_flight = self
            .store
            .operations_in_state(OperationState::InFlight)
            .await?;

        for op in in_flight {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.confirm_operation(op, head).await? {
                ConfirmStep::Confirmed { reverted } => {
                    report.confirmed += 1;
                    if reverted {
                        report.reverted += 1;
                    }
                }
                ConfirmStep::Bumped => report.bumped += 1,
                ConfirmStep::Waiting => {}
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(operation_id = %op.id, nonce = ?op.nonce))]
    async fn confirm_operation(
        &self,
        op: Operation,
        head: Head,
    ) -> Result<ConfirmStep, TxmWorkerError> {
        let attempts = self.store.get_attempts(&op.id).await?;
        let watched: Vec<&Attempt> = attempts.iter().filter(|a| a.is_watched()).collect();

        let lookups = join_all(
            watched
                .iter()
                .map(|attempt| self.chain.transaction_receipt(attempt.hash)),
        )
        .await;

        let mut found: Option<(&Attempt, TxReceipt)> = None;
        for (attempt, lookup) in watched.iter().zip(lookups) {
            match lookup {
                Ok(Some(receipt)) => {
                    if found.is_none() {
                        found = Some((*attempt, receipt));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(hash = %attempt.hash, error = %e, "Receipt lookup failed, skipping operation for this head");
                    return Ok(ConfirmStep::Waiting);
                }
            }
        }

        if let Some((mined, receipt)) = found {
            return self.settle_receipt(op, &attempts, mined, receipt, head).await;
        }

        // Receipts can vanish between heads when a shallow reorg drops the block
        let lost: Vec<&Attempt> = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Included)
            .collect();
        if !lost.is_empty() {
            let has_active = attempts.iter().any(|a| a.state == AttemptState::Active);
            let restored = lost.into_iter().map(|attempt| {
                let mut attempt = attempt.clone();
                attempt.state = if has_active {
                    AttemptState::Superseded
                } else {
                    AttemptState::Active
                };
                attempt.receipt = None;
                attempt.broadcast_block = Some(head.number);
                attempt
            });

            tracing::info!("Receipt disappeared before reaching depth, watching again");
            self.commit_in_flight(
                OperationUpdate::new(op, OperationState::InFlight).with_attempts(restored),
            )
            .await?;
            return Ok(ConfirmStep::Waiting);
        }

        let Some(live) = live_attempt(&attempts) else {
            return Ok(ConfirmStep::Waiting);
        };

        let age = head
            .number
            .saturating_sub(live.broadcast_block.unwrap_or(head.number));
        if age < self.config.bump_threshold {
            return Ok(ConfirmStep::Waiting);
        }

        tracing::info!(hash = %live.hash, age, "Attempt stuck, bumping fee");
        let Some(replacement) = self.replace_attempt(&op.id, Urgency::Normal).await? else {
            return Ok(ConfirmStep::Waiting);
        };

        self.send_until_settled(&op.id, replacement, true).await?;
        Ok(ConfirmStep::Bumped)
    }

    /// A receipt was found for `mined`. Confirms when deep enough, otherwise marks the
    /// attempt included so it is not bumped.
    async fn settle_receipt(
        &self,
        mut op: Operation,
        attempts: &[Attempt],
        mined: &Attempt,
        receipt: TxReceipt,
        head: Head,
    ) -> Result<ConfirmStep, TxmWorkerError> {
        let mut included = mined.clone();
        included.state = AttemptState::Included;
        included.receipt = Some(receipt.clone());

        if !reached_depth(receipt.block_number, op.confirmation_depth, head.number) {
            if mined.state == AttemptState::Included && mined.receipt.as_ref() == Some(&receipt) {
                return Ok(ConfirmStep::Waiting);
            }

            tracing::debug!(
                hash = %mined.hash,
                block = receipt.block_number,
                depth = op.confirmation_depth,
                "Receipt found, waiting for confirmation depth"
            );
            self.commit_in_flight(
                OperationUpdate::new(op, OperationState::InFlight).with_attempt(included),
            )
            .await?;
            return Ok(ConfirmStep::Waiting);
        }

        let siblings = attempts
            .iter()
            .filter(|a| a.hash != mined.hash && a.state != AttemptState::Dead)
            .map(|a| {
                let mut a = a.clone();
                a.state = AttemptState::Dead;
                a
            });

        let reverted = !receipt.status;
        op.state = OperationState::Confirmed;
        op.reverted = reverted;
        op.receipt = Some(receipt.clone());
        op.updated_at = Self::now();

        let update = OperationUpdate::new(op, OperationState::InFlight)
            .with_attempt(included)
            .with_attempts(siblings);

        match self.store.commit(update).await {
            Ok(()) => {}
            Err(TransactionStoreError::StateConflict { .. }) => return Ok(ConfirmStep::Waiting),
            Err(e) => return Err(e.into()),
        }

        if reverted {
            tracing::warn!(hash = %mined.hash, block = receipt.block_number, "Operation confirmed but reverted");
        } else {
            tracing::info!(hash = %mined.hash, block = receipt.block_number, "Operation confirmed");
        }

        Ok(ConfirmStep::Confirmed { reverted })
    }

    async fn commit_in_flight(&self, update: OperationUpdate) -> Result<(), TxmWorkerError> {
        match self.store.commit(update).await {
            Ok(()) | Err(TransactionStoreError::StateConflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========== FINALIZE ==========
    async fn finalize_confirmed(&self, head: Head) -> Result<u32, TxmWorkerError> {
        let confirmed = self
            .store
            .operations_in_state(OperationState::Confirmed)
            .await?;

        let mut finalized = 0;
        for mut op in confirmed {
            let Some(block) = op.receipt.as_ref().map(|r| r.block_number) else {
                continue;
            };

            let depth = self.config.finality_depth.max(op.confirmation_depth);
            if !reached_depth(block, depth, head.number) {
                continue;
            }

            op.state = OperationState::Finalized;
            op.updated_at = Self::now();
            match self
                .store
                .commit(OperationUpdate::new(op, OperationState::Confirmed))
                .await
            {
                Ok(()) => finalized += 1,
                Err(TransactionStoreError::StateConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::reached_depth;

    #[test]
    fn depth_is_counted_from_the_inclusion_block() {
        assert!(!reached_depth(101, 2, 102));
        assert!(reached_depth(101, 2, 103));
        assert!(reached_depth(101, 0, 101));
        assert!(!reached_depth(105, 0, 101));
    }

    #[test]
    fn huge_depth_never_confirms() {
        assert!(!reached_depth(101, u64::MAX, 102));
        assert!(!reached_depth(101, u64::MAX, u64::MAX));
        assert!(!reached_depth(u64::MAX, 1, u64::MAX));
    }
}
