use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::txm::manager::{TransactionManager, TxmError};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum RegistryError {
    #[error("Unknown chain {chain_id}")]
    UnknownChain { chain_id: u64 },

    #[error("Chain {chain_id} is already registered")]
    DuplicateChain { chain_id: u64 },
}

/// Managers of every configured chain, keyed by chain id.
pub struct TxManagerRegistry<M: TransactionManager> {
    managers: HashMap<u64, Arc<M>>,
}

impl<M: TransactionManager> Default for TxManagerRegistry<M> {
    fn default() -> Self {
        Self {
            managers: HashMap::new(),
        }
    }
}

impl<M: TransactionManager> TxManagerRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: M) -> Result<Arc<M>, RegistryError> {
        let chain_id = manager.chain_id();
        if self.managers.contains_key(&chain_id) {
            return Err(RegistryError::DuplicateChain { chain_id });
        }

        let manager = Arc::new(manager);
        self.managers.insert(chain_id, manager.clone());
        Ok(manager)
    }

    pub fn get(&self, chain_id: u64) -> Result<Arc<M>, RegistryError> {
        self.managers
            .get(&chain_id)
            .cloned()
            .ok_or(RegistryError::UnknownChain { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.managers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts every manager, stopping at the first failure.
    pub async fn start_all(&self) -> Result<(), TxmError> {
        for chain_id in self.chain_ids() {
            if let Some(manager) = self.managers.get(&chain_id) {
                manager.start().await?;
            }
        }
        Ok(())
    }

    /// Closes every manager concurrently. Failures are logged, the first one is returned.
    pub async fn close_all(&self) -> Result<(), TxmError> {
        let results = futures::future::join_all(self.managers.values().map(|manager| async move {
            let chain_id = manager.chain_id();
            let result = manager.close().await;
            if let Err(e) = &result {
                tracing::error!(chain_id, error = %e, "Failed to close transaction manager");
            }
            result
        }))
        .await;

        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }
}
