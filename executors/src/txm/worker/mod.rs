use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::primitives::Address;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use txm_core::{
    chain::Chain,
    fees::FeeEstimator,
    heads::Head,
    signer::{AttemptSigner, UnsignedAttempt},
    transaction::{Attempt, AttemptState, FeeParams, Operation},
};

use crate::{
    metrics::current_timestamp_ms,
    txm::{config::TxmConfig, nonce_manager::NonceManager, store::TxStore},
};

mod confirm;
pub mod error;
mod reap;
mod reorg;
mod resend;
mod send;

pub use confirm::ConfirmReport;
pub use reap::ReapReport;
pub use resend::ResendReport;
pub use send::{IntakeReport, SendSettlement};

use error::TxmWorkerError;

/// Per-key coordination.
///
/// `admission` serialises the limit check with the insert, `intake` allows one broadcaster
/// pass at a time and `wake` nudges the intake loop after a submission.
pub struct KeyLane {
    pub key: Address,
    pub(crate) admission: AsyncMutex<()>,
    pub(crate) intake: AsyncMutex<()>,
    pub(crate) wake: Notify,
    pub(crate) stop: CancellationToken,
}

impl KeyLane {
    fn new(key: Address, parent: &CancellationToken) -> Self {
        Self {
            key,
            admission: AsyncMutex::new(()),
            intake: AsyncMutex::new(()),
            wake: Notify::new(),
            stop: parent.child_token(),
        }
    }
}

/// Shared state and passes of one chain's transaction manager.
///
/// The passes themselves live in the submodules: intake/broadcast in `send`, per-head
/// confirmation and bumping in `confirm`, reorg reconciliation in `reorg`, periodic
/// rebroadcast and crash recovery in `resend`, retention in `reap`.
pub struct TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    pub chain_id: u64,
    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub fees: Arc<F>,
    pub signer: Arc<K>,
    pub config: TxmConfig,
    pub nonces: NonceManager<S, C>,

    lanes: Mutex<HashMap<Address, Arc<KeyLane>>>,
    /// Held for a whole head pass and for any out-of-cycle fee bump
    pub(crate) confirm_lock: AsyncMutex<()>,
    latest_head: RwLock<Option<Head>>,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    pub shutdown: CancellationToken,
}

impl<S, C, F, K> TxmWorker<S, C, F, K>
where
    S: TxStore,
    C: Chain,
    F: FeeEstimator,
    K: AttemptSigner,
{
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        fees: Arc<F>,
        signer: Arc<K>,
        config: TxmConfig,
    ) -> Self {
        let nonces = NonceManager::new(store.clone(), chain.clone(), config.nonce_sync_tolerance);

        Self {
            chain_id: chain.chain_id(),
            store,
            chain,
            fees,
            signer,
            config,
            nonces,
            lanes: Mutex::new(HashMap::new()),
            confirm_lock: AsyncMutex::new(()),
            latest_head: RwLock::new(None),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn now() -> u64 {
        current_timestamp_ms()
    }

    // ========== KEY LANES ==========

    pub fn lane(&self, key: Address) -> Option<Arc<KeyLane>> {
        self.lanes
            .lock()
            .ok()
            .and_then(|lanes| lanes.get(&key).cloned())
    }

    pub fn lane_or_err(&self, key: Address) -> Result<Arc<KeyLane>, TxmWorkerError> {
        self.lane(key).ok_or(TxmWorkerError::KeyNotEnabled { key })
    }

    /// Registers a lane for `key`. Returns `None` if it was already enabled.
    pub(crate) fn open_lane(&self, key: Address) -> Result<Option<Arc<KeyLane>>, TxmWorkerError> {
        let mut lanes = self.lanes.lock().map_err(|e| TxmWorkerError::InternalError {
            message: format!("lane map poisoned: {e}"),
        })?;

        if lanes.contains_key(&key) {
            return Ok(None);
        }

        let lane = Arc::new(KeyLane::new(key, &self.shutdown));
        lanes.insert(key, lane.clone());
        Ok(Some(lane))
    }

    pub(crate) fn close_lane(&self, key: Address) -> Result<Option<Arc<KeyLane>>, TxmWorkerError> {
        let mut lanes = self.lanes.lock().map_err(|e| TxmWorkerError::InternalError {
            message: format!("lane map poisoned: {e}"),
        })?;

        let lane = lanes.remove(&key);
        if let Some(lane) = &lane {
            lane.stop.cancel();
        }
        Ok(lane)
    }

    pub fn enabled_keys(&self) -> Vec<Address> {
        self.lanes
            .lock()
            .map(|lanes| lanes.keys().copied().collect())
            .unwrap_or_default()
    }

    // ========== HEADS ==========

    pub fn latest_head(&self) -> Option<Head> {
        self.latest_head.read().ok().and_then(|head| *head)
    }

    pub(crate) fn set_latest_head(&self, head: Head) {
        if let Ok(mut latest) = self.latest_head.write() {
            *latest = Some(head);
        }
    }

    /// Latest known head number, asking the chain if no head has been delivered yet.
    pub(crate) async fn head_number(&self) -> Result<u64, TxmWorkerError> {
        if let Some(head) = self.latest_head() {
            return Ok(head.number);
        }

        let head = self.chain.latest_head().await?;
        Ok(head.number)
    }

    // ========== HALT ==========

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().ok().and_then(|reason| reason.clone())
    }

    /// Stops every loop and refuses further submissions. Used when the store is gone.
    pub fn halt(&self, reason: &str) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::error!(chain_id = self.chain_id, reason, "Halting transaction manager");
        if let Ok(mut slot) = self.halt_reason.lock() {
            *slot = Some(reason.to_string());
        }
        self.shutdown.cancel();
    }

    /// Logs a failed pass, halting on store failures.
    pub(crate) fn handle_pass_error(&self, pass: &str, error: &TxmWorkerError) {
        if error.is_store_unavailable() {
            self.halt(&format!("{pass} failed: {error}"));
        } else {
            tracing::warn!(chain_id = self.chain_id, pass, error = %error, "Pass failed, will retry");
        }
    }

    // ========== ATTEMPTS ==========

    /// Signs a fresh attempt for `op` at `nonce` and `fee`.
    pub(crate) async fn build_attempt(
        &self,
        op: &Operation,
        nonce: u64,
        fee: FeeParams,
        attempt_number: u32,
        broadcast_block: u64,
    ) -> Result<Attempt, txm_core::error::EngineError> {
        let signed = self
            .signer
            .sign_attempt(&UnsignedAttempt {
                chain_id: self.chain_id,
                from: op.key,
                to: op.to,
                value: op.value,
                data: op.data.clone(),
                nonce,
                gas_limit: op.gas_limit,
                fee,
            })
            .await?;

        Ok(Attempt {
            operation_id: op.id.clone(),
            attempt_number,
            hash: signed.hash,
            nonce,
            fee,
            raw: signed.raw,
            state: AttemptState::Active,
            created_at: Self::now(),
            broadcast_at: None,
            broadcast_block: Some(broadcast_block),
            send_outcomes: BTreeMap::new(),
            receipt: None,
        })
    }
}

/// The attempt currently awaiting inclusion, if any.
pub(crate) fn live_attempt(attempts: &[Attempt]) -> Option<&Attempt> {
    attempts
        .iter()
        .rev()
        .find(|attempt| attempt.state == AttemptState::Active)
}
