use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::primitives::{Address, B256};
use txm_core::transaction::{Attempt, Operation, OperationState, SendOutcome};

use super::{OperationUpdate, PendingCounts, TransactionStoreError, TxStore};

#[derive(Default)]
struct Inner {
    sequence: u64,
    operations: HashMap<String, (u64, Operation)>,
    attempts: HashMap<String, HashMap<B256, Attempt>>,
    nonces: HashMap<Address, u64>,
}

/// An accepted outcome is never replaced by a rejection from the same node.
fn merge_outcomes(attempt: &mut Attempt, outcomes: &BTreeMap<String, SendOutcome>) {
    for (node, outcome) in outcomes {
        let keep_previous = attempt
            .send_outcomes
            .get(node)
            .is_some_and(|previous| previous.is_accepted() && !outcome.is_accepted());
        if !keep_previous {
            attempt.send_outcomes.insert(node.clone(), outcome.clone());
        }
    }
}

/// Volatile [`TxStore`] for tests and local development.
#[derive(Default)]
pub struct MemoryTxStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the backend went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, TransactionStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransactionStoreError::Unavailable {
                message: "memory store marked unavailable".to_string(),
            });
        }

        self.inner
            .lock()
            .map_err(|e| TransactionStoreError::InternalError {
                message: format!("memory store lock poisoned: {e}"),
            })
    }

    fn sorted(mut ops: Vec<(u64, Operation)>) -> Vec<Operation> {
        ops.sort_by_key(|(sequence, _)| *sequence);
        ops.into_iter().map(|(_, op)| op).collect()
    }
}

impl TxStore for MemoryTxStore {
    async fn insert_operation(&self, operation: &Operation) -> Result<(), TransactionStoreError> {
        let mut inner = self.lock()?;
        inner.sequence += 1;
        let sequence = inner.sequence;
        inner
            .operations
            .insert(operation.id.clone(), (sequence, operation.clone()));
        Ok(())
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>, TransactionStoreError> {
        Ok(self.lock()?.operations.get(id).map(|(_, op)| op.clone()))
    }

    async fn get_attempts(&self, operation_id: &str) -> Result<Vec<Attempt>, TransactionStoreError> {
        let inner = self.lock()?;
        let mut attempts: Vec<Attempt> = inner
            .attempts
            .get(operation_id)
            .map(|attempts| attempts.values().cloned().collect())
            .unwrap_or_default();
        attempts.sort_by_key(|attempt| attempt.attempt_number);
        Ok(attempts)
    }

    async fn operations_in_state(
        &self,
        state: OperationState,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let inner = self.lock()?;
        Ok(Self::sorted(
            inner
                .operations
                .values()
                .filter(|(_, op)| op.state == state)
                .cloned()
                .collect(),
        ))
    }

    async fn operations_for_key(
        &self,
        key: Address,
        state: OperationState,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let inner = self.lock()?;
        Ok(Self::sorted(
            inner
                .operations
                .values()
                .filter(|(_, op)| op.key == key && op.state == state)
                .cloned()
                .collect(),
        ))
    }

    async fn operations_updated_before(
        &self,
        state: OperationState,
        cutoff_ms: u64,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let inner = self.lock()?;
        Ok(Self::sorted(
            inner
                .operations
                .values()
                .filter(|(_, op)| op.state == state && op.updated_at < cutoff_ms)
                .cloned()
                .collect(),
        ))
    }

    async fn pending_counts(&self, key: Address) -> Result<PendingCounts, TransactionStoreError> {
        let inner = self.lock()?;
        let mut counts = PendingCounts::default();
        for (_, op) in inner.operations.values().filter(|(_, op)| op.key == key) {
            match op.state {
                OperationState::Unstarted => counts.unstarted += 1,
                OperationState::InFlight => counts.in_flight += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn next_nonce(&self, key: Address) -> Result<Option<u64>, TransactionStoreError> {
        Ok(self.lock()?.nonces.get(&key).copied())
    }

    async fn set_next_nonce(&self, key: Address, nonce: u64) -> Result<(), TransactionStoreError> {
        self.lock()?.nonces.insert(key, nonce);
        Ok(())
    }

    async fn commit(&self, update: OperationUpdate) -> Result<(), TransactionStoreError> {
        let mut inner = self.lock()?;
        let id = update.operation.id.clone();

        let sequence = match inner.operations.get(&id) {
            None => {
                return Err(TransactionStoreError::OperationNotFound { operation_id: id });
            }
            Some((_, current)) if current.state != update.expected_state => {
                return Err(TransactionStoreError::StateConflict {
                    operation_id: id,
                    expected: update.expected_state,
                    actual: current.state,
                });
            }
            Some((sequence, _)) => *sequence,
        };

        if let Some(next_nonce) = update.next_nonce {
            inner.nonces.insert(update.operation.key, next_nonce);
        }

        let attempts = inner.attempts.entry(id.clone()).or_default();
        for hash in &update.removed_attempts {
            attempts.remove(hash);
        }
        for mut attempt in update.attempts {
            // Outcomes recorded since the caller read the attempt must survive the rewrite
            if let Some(stored) = attempts.get(&attempt.hash) {
                merge_outcomes(&mut attempt, &stored.send_outcomes);
                attempt.broadcast_at = stored.broadcast_at.or(attempt.broadcast_at);
            }
            attempts.insert(attempt.hash, attempt);
        }

        inner.operations.insert(id, (sequence, update.operation));
        Ok(())
    }

    async fn record_send_outcomes(
        &self,
        operation_id: &str,
        hash: B256,
        outcomes: &BTreeMap<String, SendOutcome>,
        broadcast_at: u64,
    ) -> Result<(), TransactionStoreError> {
        let mut inner = self.lock()?;
        let Some(attempt) = inner
            .attempts
            .get_mut(operation_id)
            .and_then(|attempts| attempts.get_mut(&hash))
        else {
            // Attempt was discarded or reaped while the broadcast was in progress
            return Ok(());
        };

        merge_outcomes(attempt, outcomes);
        attempt.broadcast_at.get_or_insert(broadcast_at);
        Ok(())
    }

    async fn delete_operation(
        &self,
        id: &str,
        expected_state: OperationState,
    ) -> Result<bool, TransactionStoreError> {
        let mut inner = self.lock()?;
        match inner.operations.get(id) {
            Some((_, op)) if op.state == expected_state => {
                inner.operations.remove(id);
                inner.attempts.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Bytes, U256};
    use txm_core::transaction::{AttemptState, FeeParams};

    use super::*;

    fn operation() -> Operation {
        Operation {
            id: "op".to_string(),
            chain_id: 1,
            key: Address::repeat_byte(0x11),
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::new(),
            gas_limit: 21_000,
            confirmation_depth: 0,
            state: OperationState::InFlight,
            nonce: Some(0),
            bump_count: 0,
            reverted: false,
            fatal_reason: None,
            receipt: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn attempt() -> Attempt {
        Attempt {
            operation_id: "op".to_string(),
            attempt_number: 0,
            hash: B256::repeat_byte(0x22),
            nonce: 0,
            fee: FeeParams::new(100, 10),
            raw: Bytes::new(),
            state: AttemptState::Active,
            created_at: 0,
            broadcast_at: None,
            broadcast_block: Some(100),
            send_outcomes: BTreeMap::new(),
            receipt: None,
        }
    }

    #[tokio::test]
    async fn commit_keeps_outcomes_recorded_after_read() {
        let store = MemoryTxStore::new();
        let op = operation();
        store.insert_operation(&op).await.unwrap();
        let update = OperationUpdate::new(op.clone(), OperationState::InFlight)
            .with_attempt(attempt());
        store.commit(update).await.unwrap();

        let mut stale = store.get_attempts("op").await.unwrap().remove(0);
        assert!(!stale.was_accepted());

        let accepted = BTreeMap::from([("node-a".to_string(), SendOutcome::Accepted)]);
        store
            .record_send_outcomes("op", stale.hash, &accepted, 1_000)
            .await
            .unwrap();

        stale.state = AttemptState::Included;
        store
            .commit(OperationUpdate::new(op, OperationState::InFlight).with_attempt(stale))
            .await
            .unwrap();

        let stored = store.get_attempts("op").await.unwrap().remove(0);
        assert_eq!(stored.state, AttemptState::Included);
        assert!(stored.was_accepted());
        assert_eq!(stored.broadcast_at, Some(1_000));
    }

    #[tokio::test]
    async fn later_rejection_does_not_replace_acceptance() {
        let store = MemoryTxStore::new();
        let op = operation();
        store.insert_operation(&op).await.unwrap();
        let update = OperationUpdate::new(op, OperationState::InFlight).with_attempt(attempt());
        store.commit(update).await.unwrap();

        let hash = attempt().hash;
        let accepted = BTreeMap::from([("node-a".to_string(), SendOutcome::Accepted)]);
        let rejected = BTreeMap::from([(
            "node-a".to_string(),
            SendOutcome::Rejected {
                message: "nonce too low".to_string(),
            },
        )]);
        for (outcomes, at) in [(&accepted, 1_000), (&rejected, 2_000)] {
            store
                .record_send_outcomes("op", hash, outcomes, at)
                .await
                .unwrap();
        }

        let stored = store.get_attempts("op").await.unwrap().remove(0);
        assert_eq!(stored.send_outcomes["node-a"], SendOutcome::Accepted);
        assert_eq!(stored.broadcast_at, Some(1_000));
    }
}
