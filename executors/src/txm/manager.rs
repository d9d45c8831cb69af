use std::sync::Arc;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Mutex as AsyncMutex,
    time::{Instant, MissedTickBehavior},
};
use txm_core::{
    chain::Chain,
    fees::FeeEstimator,
    heads::HeadSource,
    signer::AttemptSigner,
    transaction::{
        FatalReason, Operation, OperationState, StatusReport, SubmitRequest,
    },
};
use uuid::Uuid;

use crate::txm::{
    config::TxmConfig,
    nonce_manager::NonceManagerError,
    shutdown::{LoopHandle, ShutdownHandle},
    store::{OperationUpdate, TransactionStoreError, TxStore},
    worker::{KeyLane, TxmWorker, error::TxmWorkerError},
};

/// Why `submit` refused an operation. Returned synchronously, nothing is stored.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "reason")]
pub enum SubmitRejection {
    #[error("Key {key} has reached the in-flight limit of {limit}")]
    InFlightLimit { key: Address, limit: u64 },

    #[error("Key {key} has reached the queue limit of {limit}")]
    QueueLimit { key: Address, limit: u64 },

    #[error("Key {key} is not enabled")]
    KeyDisabled { key: Address },

    #[error("Key {key} is out of sync with the chain, resync required")]
    KeyOutOfSync { key: Address },
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TxmError {
    #[error("Submission rejected: {0}")]
    Rejected(SubmitRejection),

    #[error("{message}")]
    ChainDisabled { chain_id: u64, message: String },

    #[error("Operation {id} not found")]
    NotFound { id: String },

    #[error("Operation {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: String, state: OperationState },

    #[error("Key {key} still has {pending} pending operations")]
    KeyBusy { key: Address, pending: u64 },

    #[error("Transaction manager halted: {reason}")]
    Halted { reason: String },

    #[error("Transaction manager already started")]
    AlreadyStarted,

    #[error("Store error: {message}")]
    Store {
        message: String,
        inner_error: TransactionStoreError,
    },

    #[error("Nonce error: {message}")]
    Nonce {
        message: String,
        inner_error: NonceManagerError,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<SubmitRejection> for TxmError {
    fn from(rejection: SubmitRejection) -> Self {
        TxmError::Rejected(rejection)
    }
}

impl From<TransactionStoreError> for TxmError {
    fn from(error: TransactionStoreError) -> Self {
        TxmError::Store {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<NonceManagerError> for TxmError {
    fn from(error: NonceManagerError) -> Self {
        match error {
            NonceManagerError::Store { inner_error } => inner_error.into(),
            error => TxmError::Nonce {
                message: error.to_string(),
                inner_error: error,
            },
        }
    }
}

impl From<TxmWorkerError> for TxmError {
    fn from(error: TxmWorkerError) -> Self {
        match error {
            TxmWorkerError::StoreError { inner_error, .. } => inner_error.into(),
            TxmWorkerError::NonceError { inner_error, .. } => inner_error.into(),
            TxmWorkerError::KeyNotEnabled { key } => SubmitRejection::KeyDisabled { key }.into(),
            error => TxmError::Internal {
                message: error.to_string(),
            },
        }
    }
}

/// Public contract of one chain's transaction manager.
pub trait TransactionManager: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    /// Durably queues an operation and returns its id.
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> impl Future<Output = Result<String, TxmError>> + Send;

    fn status(&self, id: &str) -> impl Future<Output = Result<StatusReport, TxmError>> + Send;

    /// Only operations that have not been given a nonce yet can be cancelled.
    fn cancel(&self, id: &str) -> impl Future<Output = Result<(), TxmError>> + Send;

    fn enable_key(&self, key: Address) -> impl Future<Output = Result<(), TxmError>> + Send;

    fn disable_key(&self, key: Address) -> impl Future<Output = Result<(), TxmError>> + Send;

    /// Re-derives the key's nonce counter from the chain. Returns the new next nonce.
    fn resync_key(&self, key: Address) -> impl Future<Output = Result<u64, TxmError>> + Send;

    fn start(&self) -> impl Future<Output = Result<(), TxmError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TxmError>> + Send;
}

// ========== EVM MANAGER ==========

/// Transaction manager for one enabled EVM chain.
pub struct EvmTxManager<S, C, F, K, H>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
    H: HeadSource,
{
    worker: Arc<TxmWorker<S, C, F, K>>,
    heads: Arc<H>,
    loops: AsyncMutex<Option<ShutdownHandle>>,
}

impl<S, C, F, K, H> EvmTxManager<S, C, F, K, H>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
    H: HeadSource,
{
    /// Builds the manager and enables the configured keys. Submissions are accepted right
    /// away and picked up once the manager is started.
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        fees: Arc<F>,
        signer: Arc<K>,
        heads: Arc<H>,
        config: TxmConfig,
    ) -> Result<Self, TxmError> {
        let keys = config.keys.clone();
        let worker = Arc::new(TxmWorker::new(store, chain, fees, signer, config));
        for key in keys {
            worker.open_lane(key)?;
        }

        Ok(Self {
            worker,
            heads,
            loops: AsyncMutex::new(None),
        })
    }

    pub fn worker(&self) -> &Arc<TxmWorker<S, C, F, K>> {
        &self.worker
    }

    fn ensure_running(&self) -> Result<(), TxmError> {
        if self.worker.is_halted() {
            return Err(TxmError::Halted {
                reason: self.worker.halt_reason().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Halts on store failures before handing the error back.
    fn store_failure(&self, error: TransactionStoreError) -> TxmError {
        if error.is_unavailable() {
            self.worker.halt(&format!("store failed: {error}"));
        }
        error.into()
    }

    async fn recover_key(&self, key: Address) -> Result<(), TxmError> {
        match self.worker.nonces.recover(key).await {
            Ok(sync) if !sync.in_sync => {
                tracing::warn!(
                    chain_id = self.worker.chain_id,
                    key = %key,
                    local = sync.local,
                    chain = sync.chain,
                    "Key is out of sync, submissions paused until resync"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(NonceManagerError::Store { inner_error }) => Err(self.store_failure(inner_error)),
            Err(e) => {
                tracing::warn!(chain_id = self.worker.chain_id, key = %key, error = %e, "Nonce recovery failed, will retry on first reservation");
                Ok(())
            }
        }
    }

    fn spawn_intake(&self, lane: Arc<KeyLane>) -> LoopHandle {
        let worker = self.worker.clone();
        let name = format!("intake:{}", lane.key);

        LoopHandle::new(
            name,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(worker.config.broadcast_poll_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = lane.stop.cancelled() => break,
                        _ = lane.wake.notified() => {}
                        _ = ticker.tick() => {}
                    }

                    if let Err(e) = worker.broadcast_pass(lane.key).await {
                        worker.handle_pass_error("broadcast", &e);
                    }
                }

                Ok(())
            }),
        )
    }

    fn spawn_head_loop(&self) -> LoopHandle {
        let worker = self.worker.clone();
        let mut heads = self.heads.subscribe(worker.config.head_buffer);

        LoopHandle::new(
            "heads",
            tokio::spawn(async move {
                loop {
                    let head = tokio::select! {
                        _ = worker.shutdown.cancelled() => break,
                        head = heads.recv() => head,
                    };
                    let Some(mut head) = head else {
                        tracing::warn!(chain_id = worker.chain_id, "Head source closed, confirmer stopped");
                        break;
                    };

                    // Only the newest head matters once we fall behind
                    while let Ok(newer) = heads.try_recv() {
                        head = newer;
                    }

                    if let Err(e) = worker.process_head(head).await {
                        worker.handle_pass_error("confirm", &e);
                    }
                }

                Ok(())
            }),
        )
    }

    fn spawn_resend_loop(&self) -> LoopHandle {
        let worker = self.worker.clone();

        LoopHandle::new(
            "resend",
            tokio::spawn(async move {
                let period = worker.config.resend_interval();
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = worker.shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    if let Err(e) = worker.resend_pass().await {
                        worker.handle_pass_error("resend", &e);
                    }
                }

                Ok(())
            }),
        )
    }

    fn spawn_reap_loop(&self) -> LoopHandle {
        let worker = self.worker.clone();

        LoopHandle::new(
            "reap",
            tokio::spawn(async move {
                let period = worker.config.reap_interval();
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = worker.shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    if let Err(e) = worker.reap_pass().await {
                        worker.handle_pass_error("reap", &e);
                    }
                }

                Ok(())
            }),
        )
    }
}

impl<S, C, F, K, H> TransactionManager for EvmTxManager<S, C, F, K, H>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
    H: HeadSource,
{
    fn chain_id(&self) -> u64 {
        self.worker.chain_id
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id, key = %request.key))]
    async fn submit(&self, request: SubmitRequest) -> Result<String, TxmError> {
        self.ensure_running()?;

        let key = request.key;
        let lane = self
            .worker
            .lane(key)
            .ok_or(SubmitRejection::KeyDisabled { key })?;
        let _admission = lane.admission.lock().await;

        if self.worker.nonces.is_out_of_sync(key).await? {
            return Err(SubmitRejection::KeyOutOfSync { key }.into());
        }

        let config = &self.worker.config;
        let counts = self
            .worker
            .store
            .pending_counts(key)
            .await
            .map_err(|e| self.store_failure(e))?;

        if counts.total() >= config.max_in_flight {
            return Err(SubmitRejection::InFlightLimit {
                key,
                limit: config.max_in_flight,
            }
            .into());
        }
        if counts.unstarted >= config.max_queued {
            return Err(SubmitRejection::QueueLimit {
                key,
                limit: config.max_queued,
            }
            .into());
        }

        let now = TxmWorker::<S, C, F, K>::now();
        let op = Operation {
            id: Uuid::new_v4().to_string(),
            chain_id: self.worker.chain_id,
            key,
            to: request.to,
            value: request.value,
            data: request.data,
            gas_limit: request.gas_limit.unwrap_or(config.default_gas_limit),
            confirmation_depth: request.confirmation_depth,
            state: OperationState::Unstarted,
            nonce: None,
            bump_count: 0,
            reverted: false,
            fatal_reason: None,
            receipt: None,
            created_at: now,
            updated_at: now,
        };

        self.worker
            .store
            .insert_operation(&op)
            .await
            .map_err(|e| self.store_failure(e))?;

        tracing::info!(operation_id = %op.id, "Operation queued");
        lane.wake.notify_one();
        Ok(op.id)
    }

    async fn status(&self, id: &str) -> Result<StatusReport, TxmError> {
        let op = self
            .worker
            .store
            .get_operation(id)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or_else(|| TxmError::NotFound { id: id.to_string() })?;

        Ok(StatusReport::from(&op))
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id, operation_id = id))]
    async fn cancel(&self, id: &str) -> Result<(), TxmError> {
        self.ensure_running()?;

        let mut op = self
            .worker
            .store
            .get_operation(id)
            .await
            .map_err(|e| self.store_failure(e))?
            .ok_or_else(|| TxmError::NotFound { id: id.to_string() })?;

        if op.state != OperationState::Unstarted {
            return Err(TxmError::NotCancellable {
                id: id.to_string(),
                state: op.state,
            });
        }

        op.state = OperationState::FatalError;
        op.fatal_reason = Some(FatalReason::Cancelled);
        op.updated_at = TxmWorker::<S, C, F, K>::now();

        match self
            .worker
            .store
            .commit(OperationUpdate::new(op, OperationState::Unstarted))
            .await
        {
            Ok(()) => {
                tracing::info!("Operation cancelled");
                Ok(())
            }
            Err(TransactionStoreError::StateConflict { actual, .. }) => {
                Err(TxmError::NotCancellable {
                    id: id.to_string(),
                    state: actual,
                })
            }
            Err(e) => Err(self.store_failure(e)),
        }
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id, key = %key))]
    async fn enable_key(&self, key: Address) -> Result<(), TxmError> {
        self.ensure_running()?;

        let Some(lane) = self.worker.open_lane(key)? else {
            return Ok(());
        };
        tracing::info!("Key enabled");

        let mut loops = self.loops.lock().await;
        if let Some(loops) = loops.as_mut() {
            self.recover_key(key).await?;
            loops.add_loop(self.spawn_intake(lane));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id, key = %key))]
    async fn disable_key(&self, key: Address) -> Result<(), TxmError> {
        let Some(lane) = self.worker.lane(key) else {
            return Ok(());
        };
        let _admission = lane.admission.lock().await;

        let counts = self
            .worker
            .store
            .pending_counts(key)
            .await
            .map_err(|e| self.store_failure(e))?;
        if counts.total() > 0 {
            return Err(TxmError::KeyBusy {
                key,
                pending: counts.total(),
            });
        }

        self.worker.close_lane(key)?;
        self.worker.nonces.forget(key).await?;
        tracing::info!("Key disabled");
        Ok(())
    }

    async fn resync_key(&self, key: Address) -> Result<u64, TxmError> {
        self.ensure_running()?;

        let next = self.worker.nonces.resync(key).await?;
        if let Some(lane) = self.worker.lane(key) {
            lane.wake.notify_one();
        }
        Ok(next)
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id))]
    async fn start(&self) -> Result<(), TxmError> {
        self.ensure_running()?;

        let mut loops = self.loops.lock().await;
        if loops.is_some() || self.worker.shutdown.is_cancelled() {
            return Err(TxmError::AlreadyStarted);
        }

        let keys = self.worker.enabled_keys();
        for key in &keys {
            self.recover_key(*key).await?;
        }

        match self.worker.recover_unsent().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Resent attempts persisted before restart"),
            Err(e) => {
                self.worker.handle_pass_error("recovery", &e);
                self.ensure_running()?;
            }
        }

        let mut handle = ShutdownHandle::new(self.worker.shutdown.clone());
        for key in keys {
            if let Some(lane) = self.worker.lane(key) {
                handle.add_loop(self.spawn_intake(lane));
            }
        }
        handle.add_loop(self.spawn_head_loop());
        handle.add_loop(self.spawn_resend_loop());
        handle.add_loop(self.spawn_reap_loop());

        tracing::info!(loops = handle.loop_count(), "Transaction manager started");
        *loops = Some(handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(chain_id = self.worker.chain_id))]
    async fn close(&self) -> Result<(), TxmError> {
        let handle = self.loops.lock().await.take();
        self.worker.shutdown.cancel();

        match handle {
            Some(handle) => handle.shutdown().await.map_err(Into::into),
            None => Ok(()),
        }
    }
}

// ========== DISABLED CHAIN ==========

/// Stand-in for a chain with transactions turned off. Creates no state and rejects every
/// call with the same explanation.
#[derive(Debug, Clone)]
pub struct NullTxManager {
    chain_id: u64,
}

impl NullTxManager {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    pub fn error_message(&self) -> String {
        format!("Ethereum is disabled for chain {}", self.chain_id)
    }

    fn disabled(&self) -> TxmError {
        TxmError::ChainDisabled {
            chain_id: self.chain_id,
            message: self.error_message(),
        }
    }
}

impl TransactionManager for NullTxManager {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn submit(&self, _request: SubmitRequest) -> Result<String, TxmError> {
        Err(self.disabled())
    }

    async fn status(&self, _id: &str) -> Result<StatusReport, TxmError> {
        Err(self.disabled())
    }

    async fn cancel(&self, _id: &str) -> Result<(), TxmError> {
        Err(self.disabled())
    }

    async fn enable_key(&self, _key: Address) -> Result<(), TxmError> {
        Err(self.disabled())
    }

    async fn disable_key(&self, _key: Address) -> Result<(), TxmError> {
        Err(self.disabled())
    }

    async fn resync_key(&self, _key: Address) -> Result<u64, TxmError> {
        Err(self.disabled())
    }

    async fn start(&self) -> Result<(), TxmError> {
        tracing::info!(chain_id = self.chain_id, "Chain disabled, transaction manager not started");
        Ok(())
    }

    async fn close(&self) -> Result<(), TxmError> {
        Ok(())
    }
}

// ========== CHAIN VARIANTS ==========

/// Manager picked at construction time from whether the chain is enabled.
pub enum ChainTxManager<S, C, F, K, H>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
    H: HeadSource,
{
    Enabled(EvmTxManager<S, C, F, K, H>),
    Disabled(NullTxManager),
}

impl<S, C, F, K, H> TransactionManager for ChainTxManager<S, C, F, K, H>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
    H: HeadSource,
{
    fn chain_id(&self) -> u64 {
        match self {
            ChainTxManager::Enabled(m) => m.chain_id(),
            ChainTxManager::Disabled(m) => m.chain_id(),
        }
    }

    async fn submit(&self, request: SubmitRequest) -> Result<String, TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.submit(request).await,
            ChainTxManager::Disabled(m) => m.submit(request).await,
        }
    }

    async fn status(&self, id: &str) -> Result<StatusReport, TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.status(id).await,
            ChainTxManager::Disabled(m) => m.status(id).await,
        }
    }

    async fn cancel(&self, id: &str) -> Result<(), TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.cancel(id).await,
            ChainTxManager::Disabled(m) => m.cancel(id).await,
        }
    }

    async fn enable_key(&self, key: Address) -> Result<(), TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.enable_key(key).await,
            ChainTxManager::Disabled(m) => m.enable_key(key).await,
        }
    }

    async fn disable_key(&self, key: Address) -> Result<(), TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.disable_key(key).await,
            ChainTxManager::Disabled(m) => m.disable_key(key).await,
        }
    }

    async fn resync_key(&self, key: Address) -> Result<u64, TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.resync_key(key).await,
            ChainTxManager::Disabled(m) => m.resync_key(key).await,
        }
    }

    async fn start(&self) -> Result<(), TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.start().await,
            ChainTxManager::Disabled(m) => m.start().await,
        }
    }

    async fn close(&self) -> Result<(), TxmError> {
        match self {
            ChainTxManager::Enabled(m) => m.close().await,
            ChainTxManager::Disabled(m) => m.close().await,
        }
    }
}
