use serde::{Deserialize, Serialize};
use txm_core::{error::EngineError, fees::FeeError};

use crate::txm::{nonce_manager::NonceManagerError, store::TransactionStoreError};

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TxmWorkerError {
    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: TransactionStoreError,
    },

    #[error("Nonce error: {message}")]
    NonceError {
        message: String,
        inner_error: NonceManagerError,
    },

    #[error("RPC error encountered during generic operation: {message}")]
    RpcError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Fee estimation failed: {message}")]
    FeeError {
        message: String,
        inner_error: FeeError,
    },

    #[error("Key {key} is not enabled")]
    KeyNotEnabled { key: alloy::primitives::Address },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl TxmWorkerError {
    /// The store failed in a way that makes the manager unusable.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            TxmWorkerError::StoreError { inner_error, .. } => inner_error.is_unavailable(),
            TxmWorkerError::NonceError {
                inner_error: NonceManagerError::Store { inner_error },
                ..
            } => inner_error.is_unavailable(),
            _ => false,
        }
    }
}

impl From<TransactionStoreError> for TxmWorkerError {
    fn from(error: TransactionStoreError) -> Self {
        TxmWorkerError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<NonceManagerError> for TxmWorkerError {
    fn from(error: NonceManagerError) -> Self {
        TxmWorkerError::NonceError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<FeeError> for TxmWorkerError {
    fn from(error: FeeError) -> Self {
        TxmWorkerError::FeeError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<EngineError> for TxmWorkerError {
    fn from(error: EngineError) -> Self {
        TxmWorkerError::RpcError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}
