use std::time::Instant;

use alloy::primitives::Address;
use txm_core::transaction::{StatusReport, SubmitRequest};

use crate::{
    metrics::record_call,
    txm::manager::{TransactionManager, TxmError},
};

/// Records duration and outcome of every call to the wrapped manager.
pub struct ObservedTxManager<M: TransactionManager> {
    inner: M,
}

impl<M: TransactionManager> ObservedTxManager<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    async fn observe<T>(
        &self,
        method: &str,
        call: impl Future<Output = Result<T, TxmError>>,
    ) -> Result<T, TxmError> {
        let started = Instant::now();
        let result = call.await;
        record_call(
            self.inner.chain_id(),
            method,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

impl<M: TransactionManager> TransactionManager for ObservedTxManager<M> {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    async fn submit(&self, request: SubmitRequest) -> Result<String, TxmError> {
        self.observe("submit", self.inner.submit(request)).await
    }

    async fn status(&self, id: &str) -> Result<StatusReport, TxmError> {
        self.observe("status", self.inner.status(id)).await
    }

    async fn cancel(&self, id: &str) -> Result<(), TxmError> {
        self.observe("cancel", self.inner.cancel(id)).await
    }

    async fn enable_key(&self, key: Address) -> Result<(), TxmError> {
        self.observe("enable_key", self.inner.enable_key(key)).await
    }

    async fn disable_key(&self, key: Address) -> Result<(), TxmError> {
        self.observe("disable_key", self.inner.disable_key(key)).await
    }

    async fn resync_key(&self, key: Address) -> Result<u64, TxmError> {
        self.observe("resync_key", self.inner.resync_key(key)).await
    }

    async fn start(&self) -> Result<(), TxmError> {
        self.observe("start", self.inner.start()).await
    }

    async fn close(&self) -> Result<(), TxmError> {
        self.observe("close", self.inner.close()).await
    }
}
