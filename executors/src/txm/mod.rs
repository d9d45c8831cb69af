pub mod config;
pub mod error_classifier;
pub mod manager;
pub mod nonce_manager;
pub mod observed;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export main types
pub use config::TxmConfig;
pub use manager::{
    ChainTxManager, EvmTxManager, NullTxManager, SubmitRejection, TransactionManager, TxmError,
};
pub use observed::ObservedTxManager;
pub use registry::{RegistryError, TxManagerRegistry};
pub use store::{MemoryTxStore, RedisTxStore, TransactionStoreError, TxStore};
pub use worker::{ConfirmReport, ReapReport, ResendReport, TxmWorker};
