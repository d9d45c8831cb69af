use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use txm_core::{chain::Chain, error::EngineError};

use crate::txm::store::{TransactionStoreError, TxStore};

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum NonceManagerError {
    #[error("Key {key} is out of sync with the chain: local {local}, chain {chain}")]
    OutOfSync { key: Address, local: u64, chain: u64 },

    #[error("Failed to read transaction count for {key}: {inner_error}")]
    ChainQuery {
        key: Address,
        inner_error: EngineError,
    },

    #[error("Store error: {inner_error}")]
    Store { inner_error: TransactionStoreError },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<TransactionStoreError> for NonceManagerError {
    fn from(error: TransactionStoreError) -> Self {
        NonceManagerError::Store { inner_error: error }
    }
}

/// Result of comparing the local counter with the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceSync {
    pub local: u64,
    pub chain: u64,
    pub in_sync: bool,
}

/// Drift rule between the local next nonce `local`, the chain's pending count `chain` and
/// the number of operations in flight.
///
/// The chain may be ahead of us by at most `tolerance`, and we may be ahead of the chain
/// by what we have in flight plus `tolerance`.
pub fn is_within_tolerance(local: u64, chain: u64, in_flight: u64, tolerance: u64) -> bool {
    chain <= local.saturating_add(tolerance)
        && local <= chain.saturating_add(in_flight).saturating_add(tolerance)
}

#[derive(Debug, Default)]
struct KeyNonceState {
    next: Option<u64>,
    out_of_sync: bool,
    last_chain_count: u64,
}

/// A nonce held for one key. The key's sequencer stays locked until this is committed or
/// dropped, and dropping leaves the counter where it was.
pub struct NonceReservation {
    key: Address,
    nonce: u64,
    guard: OwnedMutexGuard<KeyNonceState>,
}

impl NonceReservation {
    pub fn key(&self) -> Address {
        self.key
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Call after the store persisted `nonce + 1` together with the first attempt.
    pub fn commit(mut self) {
        self.guard.next = Some(self.nonce + 1);
    }
}

/// Per-key nonce sequencer.
///
/// The store's persisted counter is authoritative across restarts. The chain's pending
/// transaction count is used to seed new keys and to detect drift.
pub struct NonceManager<S: TxStore, C: Chain> {
    store: Arc<S>,
    chain: Arc<C>,
    tolerance: u64,
    keys: Mutex<HashMap<Address, Arc<AsyncMutex<KeyNonceState>>>>,
}

impl<S: TxStore, C: Chain> NonceManager<S, C> {
    pub fn new(store: Arc<S>, chain: Arc<C>, tolerance: u64) -> Self {
        Self {
            store,
            chain,
            tolerance,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: Address) -> Result<Arc<AsyncMutex<KeyNonceState>>, NonceManagerError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|e| NonceManagerError::InternalError {
                message: format!("nonce slot map poisoned: {e}"),
            })?;
        Ok(keys.entry(key).or_default().clone())
    }

    async fn chain_count(&self, key: Address) -> Result<u64, NonceManagerError> {
        self.chain
            .transaction_count(key)
            .await
            .map_err(|inner_error| NonceManagerError::ChainQuery { key, inner_error })
    }

    /// Reconciles the local counter with the store and the chain.
    ///
    /// Keys with no persisted counter are seeded from the chain. Otherwise the drift rule
    /// decides whether the key stays usable; when in sync a chain count ahead of us is adopted.
    #[tracing::instrument(skip_all, fields(key = %key, chain_id = self.chain.chain_id()))]
    pub async fn recover(&self, key: Address) -> Result<NonceSync, NonceManagerError> {
        let slot = self.slot(key)?;
        let mut state = slot.lock().await;
        self.recover_locked(key, &mut state).await
    }

    async fn recover_locked(
        &self,
        key: Address,
        state: &mut KeyNonceState,
    ) -> Result<NonceSync, NonceManagerError> {
        let chain = self.chain_count(key).await?;
        state.last_chain_count = chain;

        let Some(local) = self.store.next_nonce(key).await? else {
            self.store.set_next_nonce(key, chain).await?;
            state.next = Some(chain);
            state.out_of_sync = false;
            tracing::info!(nonce = chain, "Seeded nonce counter from chain");
            return Ok(NonceSync {
                local: chain,
                chain,
                in_sync: true,
            });
        };

        let in_flight = self.store.pending_counts(key).await?.in_flight;
        let in_sync = is_within_tolerance(local, chain, in_flight, self.tolerance);

        if !in_sync {
            state.next = Some(local);
            state.out_of_sync = true;
            tracing::warn!(
                local,
                chain,
                in_flight,
                tolerance = self.tolerance,
                "Nonce counter drifted from chain, pausing key until resync"
            );
            return Ok(NonceSync {
                local,
                chain,
                in_sync,
            });
        }

        let next = if chain > local {
            self.store.set_next_nonce(key, chain).await?;
            tracing::info!(local, chain, "Adopting chain transaction count");
            chain
        } else {
            local
        };

        state.next = Some(next);
        state.out_of_sync = false;
        Ok(NonceSync {
            local: next,
            chain,
            in_sync,
        })
    }

    /// Holds the key's sequencer and returns the next nonce to assign.
    pub async fn reserve(&self, key: Address) -> Result<NonceReservation, NonceManagerError> {
        let slot = self.slot(key)?;
        let mut guard = slot.lock_owned().await;

        if guard.next.is_none() {
            self.recover_locked(key, &mut guard).await?;
        }

        if guard.out_of_sync {
            return Err(NonceManagerError::OutOfSync {
                key,
                local: guard.next.unwrap_or_default(),
                chain: guard.last_chain_count,
            });
        }

        let nonce = guard
            .next
            .ok_or_else(|| NonceManagerError::InternalError {
                message: format!("nonce counter for {key} not initialised"),
            })?;

        Ok(NonceReservation { key, nonce, guard })
    }

    /// Operator resync: the counter becomes the chain's pending count and the key resumes.
    #[tracing::instrument(skip_all, fields(key = %key, chain_id = self.chain.chain_id()))]
    pub async fn resync(&self, key: Address) -> Result<u64, NonceManagerError> {
        let slot = self.slot(key)?;
        let mut state = slot.lock().await;

        let chain = self.chain_count(key).await?;
        self.store.set_next_nonce(key, chain).await?;

        tracing::info!(previous = ?state.next, nonce = chain, "Resynced nonce counter");
        state.next = Some(chain);
        state.last_chain_count = chain;
        state.out_of_sync = false;
        Ok(chain)
    }

    /// Moves the counter forward to the chain's pending count after a nonce-too-low rejection.
    /// Never moves it backwards.
    #[tracing::instrument(skip_all, fields(key = %key, chain_id = self.chain.chain_id()))]
    pub async fn advance_to_chain(&self, key: Address) -> Result<u64, NonceManagerError> {
        let slot = self.slot(key)?;
        let mut state = slot.lock().await;

        let chain = self.chain_count(key).await?;
        let local = match state.next {
            Some(next) => next,
            None => self.store.next_nonce(key).await?.unwrap_or(chain),
        };
        let next = local.max(chain);
        if next != local {
            self.store.set_next_nonce(key, next).await?;
            tracing::warn!(local, chain, "Nonce counter was behind the chain, advanced");
        }

        state.next = Some(next);
        state.last_chain_count = chain;
        state.out_of_sync = false;
        Ok(next)
    }

    pub async fn is_out_of_sync(&self, key: Address) -> Result<bool, NonceManagerError> {
        let slot = self.slot(key)?;
        let state = slot.lock().await;
        Ok(state.out_of_sync)
    }

    /// Forgets the cached counter so the next reservation reloads it.
    pub async fn forget(&self, key: Address) -> Result<(), NonceManagerError> {
        let slot = self.slot(key)?;
        let mut state = slot.lock().await;
        *state = KeyNonceState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ahead_beyond_tolerance_is_drift() {
        assert!(is_within_tolerance(10, 10, 0, 0));
        assert!(!is_within_tolerance(10, 11, 0, 0));
        assert!(is_within_tolerance(10, 11, 0, 1));
    }

    #[test]
    fn local_ahead_is_covered_by_in_flight() {
        assert!(is_within_tolerance(15, 10, 5, 0));
        assert!(!is_within_tolerance(16, 10, 5, 0));
        assert!(is_within_tolerance(16, 10, 5, 1));
    }
}
