use std::collections::BTreeMap;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use txm_core::transaction::{Attempt, Operation, OperationState, SendOutcome};

mod memory;
mod redis;

pub use memory::MemoryTxStore;
pub use redis::{RedisTxStore, TxStoreKeys};

/// One atomic write scoped to a single operation, its attempts and its key's nonce counter.
///
/// The write only lands if the stored operation is still in `expected_state`, otherwise
/// the store answers [`TransactionStoreError::StateConflict`] and nothing changes.
#[derive(Debug, Clone)]
pub struct OperationUpdate {
    pub operation: Operation,
    pub expected_state: OperationState,
    /// Inserted or overwritten, keyed by hash
    pub attempts: Vec<Attempt>,
    pub removed_attempts: Vec<B256>,
    /// New persisted next nonce for `operation.key`
    pub next_nonce: Option<u64>,
}

impl OperationUpdate {
    pub fn new(operation: Operation, expected_state: OperationState) -> Self {
        Self {
            operation,
            expected_state,
            attempts: Vec::new(),
            removed_attempts: Vec::new(),
            next_nonce: None,
        }
    }

    pub fn with_attempt(mut self, attempt: Attempt) -> Self {
        self.attempts.push(attempt);
        self
    }

    pub fn with_attempts(mut self, attempts: impl IntoIterator<Item = Attempt>) -> Self {
        self.attempts.extend(attempts);
        self
    }

    pub fn with_next_nonce(mut self, next_nonce: u64) -> Self {
        self.next_nonce = Some(next_nonce);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    pub unstarted: u64,
    pub in_flight: u64,
}

impl PendingCounts {
    pub fn total(&self) -> u64 {
        self.unstarted + self.in_flight
    }
}

/// Durable record of operations and attempts for one chain.
pub trait TxStore: Send + Sync + 'static {
    fn insert_operation(
        &self,
        operation: &Operation,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn get_operation(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Operation>, TransactionStoreError>> + Send;

    /// Attempts of one operation ordered by attempt number, with recorded send outcomes merged in.
    fn get_attempts(
        &self,
        operation_id: &str,
    ) -> impl Future<Output = Result<Vec<Attempt>, TransactionStoreError>> + Send;

    fn operations_in_state(
        &self,
        state: OperationState,
    ) -> impl Future<Output = Result<Vec<Operation>, TransactionStoreError>> + Send;

    /// Operations of one key in one state, oldest submission first.
    fn operations_for_key(
        &self,
        key: Address,
        state: OperationState,
    ) -> impl Future<Output = Result<Vec<Operation>, TransactionStoreError>> + Send;

    /// Operations in `state` whose last transition happened before `cutoff_ms`.
    fn operations_updated_before(
        &self,
        state: OperationState,
        cutoff_ms: u64,
    ) -> impl Future<Output = Result<Vec<Operation>, TransactionStoreError>> + Send;

    fn pending_counts(
        &self,
        key: Address,
    ) -> impl Future<Output = Result<PendingCounts, TransactionStoreError>> + Send;

    fn next_nonce(
        &self,
        key: Address,
    ) -> impl Future<Output = Result<Option<u64>, TransactionStoreError>> + Send;

    fn set_next_nonce(
        &self,
        key: Address,
        nonce: u64,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn commit(
        &self,
        update: OperationUpdate,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Merges per-node outcomes into an attempt. A node's accepted outcome is never replaced
    /// by a later rejection, and `broadcast_at` is only kept the first time.
    fn record_send_outcomes(
        &self,
        operation_id: &str,
        hash: B256,
        outcomes: &BTreeMap<String, SendOutcome>,
        broadcast_at: u64,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Removes an operation and all of its attempts if it is still in `expected_state`.
    /// Returns whether anything was deleted.
    fn delete_operation(
        &self,
        id: &str,
        expected_state: OperationState,
    ) -> impl Future<Output = Result<bool, TransactionStoreError>> + Send;
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TransactionStoreError {
    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Serialization error: {message}")]
    DeserError { message: String, text: String },

    #[error("Operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },

    #[error("Operation {operation_id} is {actual}, expected {expected}")]
    StateConflict {
        operation_id: String,
        expected: OperationState,
        actual: OperationState,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("WATCH failed - state changed during operation")]
    WatchFailed,
}

impl TransactionStoreError {
    /// The backing store can not be reached or misbehaves. Everything else is a
    /// per-operation condition the caller can handle.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TransactionStoreError::RedisError { .. }
                | TransactionStoreError::Unavailable { .. }
                | TransactionStoreError::InternalError { .. }
        )
    }
}

impl From<::redis::RedisError> for TransactionStoreError {
    fn from(error: ::redis::RedisError) -> Self {
        TransactionStoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransactionStoreError {
    fn from(error: serde_json::Error) -> Self {
        TransactionStoreError::DeserError {
            message: error.to_string(),
            text: error.to_string(),
        }
    }
}
