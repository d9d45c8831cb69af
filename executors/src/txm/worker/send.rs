use alloy::primitives::{Address, B256};
use txm_core::{
    chain::Chain,
    fees::{FeeError, FeeEstimator, Urgency},
    signer::AttemptSigner,
    transaction::{Attempt, AttemptState, FatalReason, Operation, OperationState},
};

use crate::txm::{
    error_classifier::{BroadcastVerdict, aggregate},
    nonce_manager::NonceManagerError,
    store::{OperationUpdate, TransactionStoreError, TxStore},
    worker::{TxmWorker, error::TxmWorkerError, live_attempt},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    /// Operations moved to in-flight and broadcast
    pub started: u32,
    /// Operations failed before getting a nonce
    pub failed: u32,
    /// Operations sent back to the queue after nonce drift
    pub requeued: u32,
}

/// How a send loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSettlement {
    /// Accepted, left for the resender, or given up on. The confirmer takes it from here.
    Settled,
    /// Nonce drift sent the operation back to `unstarted`.
    Requeued,
}

enum StartOutcome {
    Continue,
    Stop,
}

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    // ========== INTAKE FLOW ==========
    /// Drains the key's `unstarted` queue in submission order.
    ///
    /// Anything that prevents the head of the queue from starting (no fee quote, paused
    /// sequencer, unreachable chain) ends the pass so later operations can not overtake it.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain_id, key = %key))]
    pub async fn broadcast_pass(&self, key: Address) -> Result<IntakeReport, TxmWorkerError> {
        let lane = self.lane_or_err(key)?;
        let _intake = lane.intake.lock().await;

        let mut report = IntakeReport::default();
        let queued = self
            .store
            .operations_for_key(key, OperationState::Unstarted)
            .await?;

        for op in queued {
            if lane.stop.is_cancelled() {
                break;
            }

            match self.start_operation(op, &mut report).await? {
                StartOutcome::Continue => continue,
                StartOutcome::Stop => break,
            }
        }

        if report != IntakeReport::default() {
            tracing::debug!(
                started = report.started,
                failed = report.failed,
                requeued = report.requeued,
                "Intake pass finished"
            );
        }

        Ok(report)
    }

    /// Assigns a nonce, persists the first attempt together with the `in-flight` transition,
    /// then broadcasts.
    #[tracing::instrument(skip_all, fields(operation_id = %op.id))]
    async fn start_operation(
        &self,
        mut op: Operation,
        report: &mut IntakeReport,
    ) -> Result<StartOutcome, TxmWorkerError> {
        let fee = match self.fees.quote(Urgency::Normal).await {
            Ok(fee) => fee,
            Err(e) => {
                tracing::warn!(error = %e, "Fee quote failed, leaving operation queued");
                return Ok(StartOutcome::Stop);
            }
        };

        let reservation = match self.nonces.reserve(op.key).await {
            Ok(reservation) => reservation,
            Err(NonceManagerError::Store { inner_error }) => return Err(inner_error.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Nonce reservation failed, leaving operation queued");
                return Ok(StartOutcome::Stop);
            }
        };
        let nonce = reservation.nonce();

        let head = match self.head_number().await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "No chain head available, leaving operation queued");
                return Ok(StartOutcome::Stop);
            }
        };

        let attempt = match self.build_attempt(&op, nonce, fee, 1, head).await {
            Ok(attempt) => attempt,
            Err(e) => {
                drop(reservation);
                tracing::error!(nonce, error = %e, "Failed to sign first attempt, failing operation");

                let mut failed = op.clone();
                failed.state = OperationState::FatalError;
                failed.fatal_reason = Some(FatalReason::SigningFailed {
                    message: e.to_string(),
                });
                failed.updated_at = Self::now();

                match self
                    .store
                    .commit(OperationUpdate::new(failed, OperationState::Unstarted))
                    .await
                {
                    Ok(()) => report.failed += 1,
                    Err(TransactionStoreError::StateConflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(StartOutcome::Continue);
            }
        };

        op.state = OperationState::InFlight;
        op.nonce = Some(nonce);
        op.updated_at = Self::now();

        let update = OperationUpdate::new(op.clone(), OperationState::Unstarted)
            .with_attempt(attempt.clone())
            .with_next_nonce(nonce + 1);

        match self.store.commit(update).await {
            Ok(()) => reservation.commit(),
            Err(TransactionStoreError::StateConflict { actual, .. }) => {
                // Cancelled between the queue read and now
                tracing::debug!(state = %actual, "Operation left the queue, skipping");
                return Ok(StartOutcome::Continue);
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(nonce, hash = %attempt.hash, "Operation in flight");
        report.started += 1;

        match self.send_until_settled(&op.id, attempt, false).await? {
            SendSettlement::Settled => Ok(StartOutcome::Continue),
            SendSettlement::Requeued => {
                report.requeued += 1;
                Ok(StartOutcome::Stop)
            }
        }
    }

    // ========== SEND LOOP ==========
    /// Broadcasts `attempt` and acts on the aggregated verdict until it settles.
    ///
    /// Underpriced rejections replace the attempt right away, which needs the confirm lock;
    /// pass `confirm_lock_held` when calling from inside a head pass.
    pub(crate) async fn send_until_settled(
        &self,
        operation_id: &str,
        mut attempt: Attempt,
        confirm_lock_held: bool,
    ) -> Result<SendSettlement, TxmWorkerError> {
        loop {
            let verdict = self.broadcast_attempt(&attempt).await?;

            match verdict {
                BroadcastVerdict::Accepted => {
                    tracing::debug!(operation_id, hash = %attempt.hash, "Attempt accepted");
                    return Ok(SendSettlement::Settled);
                }
                BroadcastVerdict::Transient { message } => {
                    tracing::warn!(operation_id, hash = %attempt.hash, error = %message, "Transient send failure, resender will retry");
                    return Ok(SendSettlement::Settled);
                }
                BroadcastVerdict::Underpriced { message } => {
                    tracing::info!(operation_id, hash = %attempt.hash, error = %message, "Attempt underpriced, bumping fee");

                    let replacement = if confirm_lock_held {
                        self.replace_attempt(operation_id, Urgency::High).await?
                    } else {
                        let _confirm = self.confirm_lock.lock().await;
                        self.replace_attempt(operation_id, Urgency::High).await?
                    };

                    match replacement {
                        Some(next) => attempt = next,
                        None => return Ok(SendSettlement::Settled),
                    }
                }
                BroadcastVerdict::NonceTooLow { message } => {
                    return self
                        .handle_nonce_too_low(operation_id, &attempt, &message)
                        .await;
                }
                BroadcastVerdict::Fatal(reason) => {
                    self.handle_fatal_rejection(operation_id, attempt.hash, reason)
                        .await?;
                    return Ok(SendSettlement::Settled);
                }
            }
        }
    }

    /// Sends the raw attempt to every node and records what each said.
    pub(crate) async fn broadcast_attempt(
        &self,
        attempt: &Attempt,
    ) -> Result<BroadcastVerdict, TxmWorkerError> {
        let results = self.chain.broadcast(&attempt.raw).await;
        let (verdict, outcomes) = aggregate(&results);

        self.store
            .record_send_outcomes(&attempt.operation_id, attempt.hash, &outcomes, Self::now())
            .await?;

        Ok(verdict)
    }

    // ========== FEE BUMP ==========
    /// Supersedes the live attempt with a higher-fee one at the same nonce.
    ///
    /// Caller must hold the confirm lock. Returns `None` when there is nothing to replace,
    /// the fee could not be estimated this time, or the operation ran out of bumps and was
    /// failed.
    #[tracing::instrument(skip_all, fields(operation_id = %operation_id))]
    pub(crate) async fn replace_attempt(
        &self,
        operation_id: &str,
        urgency: Urgency,
    ) -> Result<Option<Attempt>, TxmWorkerError> {
        let Some(mut op) = self.store.get_operation(operation_id).await? else {
            return Ok(None);
        };
        if op.state != OperationState::InFlight {
            return Ok(None);
        }

        let attempts = self.store.get_attempts(operation_id).await?;
        if attempts.iter().any(|a| a.state == AttemptState::Included) {
            return Ok(None);
        }
        let Some(live) = live_attempt(&attempts).cloned() else {
            return Ok(None);
        };

        if op.bump_count >= self.config.max_bump_depth {
            self.fail_exhausted(op).await?;
            return Ok(None);
        }

        let fee = match self.fees.bump(&live.fee).await {
            Ok(fee) => fee,
            Err(FeeError::CapReached { cap }) => {
                tracing::warn!(cap, bumps = op.bump_count, "Fee cap reached");
                self.fail_exhausted(op).await?;
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, urgency = ?urgency, "Fee bump estimation failed, retrying later");
                return Ok(None);
            }
        };

        if !fee.is_strictly_above(&live.fee) {
            return Err(TxmWorkerError::InternalError {
                message: format!(
                    "fee estimator returned {fee:?}, not above {:?}",
                    live.fee
                ),
            });
        }

        let head = self.head_number().await?;
        let next_number = attempts
            .iter()
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0)
            + 1;

        let replacement = match self
            .build_attempt(&op, live.nonce, fee, next_number, head)
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to sign replacement, keeping current attempt");
                return Ok(None);
            }
        };

        let mut superseded = live.clone();
        superseded.state = AttemptState::Superseded;
        op.bump_count += 1;

        let update = OperationUpdate::new(op.clone(), OperationState::InFlight)
            .with_attempts([superseded, replacement.clone()]);

        match self.store.commit(update).await {
            Ok(()) => {}
            Err(TransactionStoreError::StateConflict { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            nonce = live.nonce,
            previous_hash = %live.hash,
            hash = %replacement.hash,
            bump = op.bump_count,
            max_fee_per_gas = replacement.fee.max_fee_per_gas,
            max_priority_fee_per_gas = replacement.fee.max_priority_fee_per_gas,
            "Replaced attempt with higher fee"
        );

        Ok(Some(replacement))
    }

    async fn fail_exhausted(&self, mut op: Operation) -> Result<(), TxmWorkerError> {
        tracing::error!(
            operation_id = %op.id,
            nonce = ?op.nonce,
            bumps = op.bump_count,
            "Fee bumps exhausted, failing operation"
        );

        op.fatal_reason = Some(FatalReason::FeeBumpExhausted {
            bumps: op.bump_count,
        });
        op.state = OperationState::FatalError;
        op.updated_at = Self::now();

        match self
            .store
            .commit(OperationUpdate::new(op, OperationState::InFlight))
            .await
        {
            Ok(()) | Err(TransactionStoreError::StateConflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========== REJECTIONS ==========
    /// Nonce-too-low on an operation nobody ever saw means the key's nonce was used outside
    /// this manager: requeue the operation and move the counter up to the chain.
    async fn handle_nonce_too_low(
        &self,
        operation_id: &str,
        attempt: &Attempt,
        message: &str,
    ) -> Result<SendSettlement, TxmWorkerError> {
        let Some(mut op) = self.store.get_operation(operation_id).await? else {
            return Ok(SendSettlement::Settled);
        };
        if op.state != OperationState::InFlight {
            return Ok(SendSettlement::Settled);
        }

        let attempts = self.store.get_attempts(operation_id).await?;
        let seen = attempts
            .iter()
            .any(|a| a.receipt.is_some() || a.was_accepted());
        if seen {
            tracing::info!(
                operation_id,
                hash = %attempt.hash,
                error = message,
                "Nonce already used but an earlier attempt was accepted, leaving to confirmer"
            );
            return Ok(SendSettlement::Settled);
        }

        tracing::warn!(
            operation_id,
            nonce = attempt.nonce,
            error = message,
            "Nonce drift detected, requeueing operation"
        );

        let removed: Vec<B256> = attempts.iter().map(|a| a.hash).collect();
        op.state = OperationState::Unstarted;
        op.nonce = None;
        op.bump_count = 0;
        op.updated_at = Self::now();

        let mut update = OperationUpdate::new(op.clone(), OperationState::InFlight);
        update.removed_attempts = removed;

        match self.store.commit(update).await {
            Ok(()) => {}
            Err(TransactionStoreError::StateConflict { .. }) => return Ok(SendSettlement::Settled),
            Err(e) => return Err(e.into()),
        }

        match self.nonces.advance_to_chain(op.key).await {
            Ok(next) => tracing::info!(key = %op.key, next, "Nonce counter moved to chain"),
            Err(NonceManagerError::Store { inner_error }) => return Err(inner_error.into()),
            Err(e) => tracing::warn!(key = %op.key, error = %e, "Failed to advance nonce counter"),
        }

        if let Some(lane) = self.lane(op.key) {
            lane.wake.notify_one();
        }

        Ok(SendSettlement::Requeued)
    }

    /// Insufficient funds or a malformed payload.
    ///
    /// Fails the operation unless one of its attempts already reached a node, in which case
    /// that attempt may still be mined: the rejected one is dropped and the most recent
    /// earlier attempt goes back to being live.
    async fn handle_fatal_rejection(
        &self,
        operation_id: &str,
        rejected: B256,
        reason: FatalReason,
    ) -> Result<(), TxmWorkerError> {
        let Some(mut op) = self.store.get_operation(operation_id).await? else {
            return Ok(());
        };
        if op.state != OperationState::InFlight {
            return Ok(());
        }

        let attempts = self.store.get_attempts(operation_id).await?;

        if attempts
            .iter()
            .any(|a| a.hash == rejected && a.was_accepted())
        {
            tracing::warn!(
                operation_id,
                hash = %rejected,
                reason = %reason,
                "Attempt rejected after an earlier acceptance, keeping it under watch"
            );
            return Ok(());
        }

        let accepted_earlier = attempts
            .iter()
            .any(|a| a.hash != rejected && (a.was_accepted() || a.receipt.is_some()));

        if accepted_earlier {
            tracing::warn!(
                operation_id,
                hash = %rejected,
                reason = %reason,
                "Replacement rejected, keeping earlier attempt under watch"
            );

            let mut changed = Vec::new();
            if let Some(mut dropped) = attempts.iter().find(|a| a.hash == rejected).cloned() {
                dropped.state = AttemptState::Dead;
                changed.push(dropped);
            }
            if let Some(mut previous) = attempts
                .iter()
                .rev()
                .find(|a| a.hash != rejected && a.state == AttemptState::Superseded)
                .cloned()
            {
                previous.state = AttemptState::Active;
                changed.push(previous);
            }

            let update =
                OperationUpdate::new(op, OperationState::InFlight).with_attempts(changed);
            return match self.store.commit(update).await {
                Ok(()) | Err(TransactionStoreError::StateConflict { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        tracing::error!(operation_id, hash = %rejected, reason = %reason, "Attempt rejected, failing operation");

        let dead = attempts.into_iter().map(|mut a| {
            a.state = AttemptState::Dead;
            a
        });

        op.state = OperationState::FatalError;
        op.fatal_reason = Some(reason);
        op.updated_at = Self::now();

        match self
            .store
            .commit(OperationUpdate::new(op, OperationState::InFlight).with_attempts(dead))
            .await
        {
            Ok(()) | Err(TransactionStoreError::StateConflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
