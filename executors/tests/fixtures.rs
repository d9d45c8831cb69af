#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, Bytes, U256, keccak256},
    signers::local::PrivateKeySigner,
};
use tokio::sync::mpsc;
use txm_core::{
    chain::{Chain, NodeSendResult},
    error::{EngineError, RpcErrorKind, RpcErrorResponse},
    fees::{FeeError, FeeEstimator, Urgency, bump_fee},
    heads::{Head, HeadSource},
    signer::LocalKeySigner,
    transaction::{FeeParams, SubmitRequest, TxReceipt},
};
use txm_executors::txm::{ChainTxManager, EvmTxManager, MemoryTxStore, TxmConfig};

pub const CHAIN_ID: u64 = 1337;
pub const NODE: &str = "primary";

// Setup tracing for tests
pub fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "txm_executors=debug,txm_core=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub fn node_error(message: &str) -> RpcErrorKind {
    RpcErrorKind::ErrorResp(RpcErrorResponse {
        code: -32000,
        message: message.to_string(),
        data: None,
    })
}

pub fn unreachable_error() -> RpcErrorKind {
    RpcErrorKind::TransportHttpError {
        status: 503,
        body: "service unavailable".to_string(),
    }
}

fn block_hash(number: u64, fork: u64) -> B256 {
    keccak256(format!("block:{number}:{fork}"))
}

// --- Scripted chain ---

struct ChainState {
    head: u64,
    fork: u64,
    canonical: HashMap<u64, B256>,
    tx_counts: HashMap<Address, u64>,
    receipts: HashMap<B256, TxReceipt>,
    scripted_sends: VecDeque<RpcErrorKind>,
    broadcasts: Vec<B256>,
    fail_queries: bool,
}

/// In-process chain: one node, canonical block hashes per height, receipts placed by the
/// test, and scripted send failures consumed one broadcast at a time.
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(head: u64) -> Self {
        let mut canonical = HashMap::new();
        for number in 0..=head {
            canonical.insert(number, block_hash(number, 0));
        }

        Self {
            chain_id: CHAIN_ID,
            state: Mutex::new(ChainState {
                head,
                fork: 0,
                canonical,
                tx_counts: HashMap::new(),
                receipts: HashMap::new(),
                scripted_sends: VecDeque::new(),
                broadcasts: Vec::new(),
                fail_queries: false,
            }),
        }
    }

    /// Moves the head to `number`, filling canonical hashes for new heights.
    pub fn advance_to(&self, number: u64) -> Head {
        let mut state = self.state.lock().unwrap();
        let fork = state.fork;
        for n in 0..=number {
            state.canonical.entry(n).or_insert_with(|| block_hash(n, fork));
        }
        state.head = number;
        Self::head_of(&state, number)
    }

    pub fn head(&self) -> Head {
        let state = self.state.lock().unwrap();
        Self::head_of(&state, state.head)
    }

    fn head_of(state: &ChainState, number: u64) -> Head {
        Head {
            number,
            hash: state.canonical[&number],
            parent_hash: number
                .checked_sub(1)
                .and_then(|parent| state.canonical.get(&parent).copied())
                .unwrap_or_default(),
        }
    }

    /// Includes `hash` in block `number` of the current canonical chain.
    pub fn mine(&self, hash: B256, number: u64, success: bool) {
        let mut state = self.state.lock().unwrap();
        let fork = state.fork;
        let in_block = *state
            .canonical
            .entry(number)
            .or_insert_with(|| block_hash(number, fork));
        state.receipts.insert(
            hash,
            TxReceipt {
                transaction_hash: hash,
                block_number: number,
                block_hash: in_block,
                status: success,
                gas_used: 21_000,
            },
        );
    }

    /// Replaces every block from `number` up with a new fork. Receipts in those blocks vanish.
    pub fn reorg_from(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        state.fork += 1;
        let fork = state.fork;
        let head = state.head;
        for n in number..=head {
            state.canonical.insert(n, block_hash(n, fork));
        }
        state.receipts.retain(|_, receipt| receipt.block_number < number);
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state.lock().unwrap().tx_counts.insert(address, count);
    }

    /// The next broadcast fails with `error`.
    pub fn fail_next_send(&self, error: RpcErrorKind) {
        self.state.lock().unwrap().scripted_sends.push_back(error);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().unwrap().fail_queries = fail;
    }

    /// Hashes of every raw transaction handed to the node, in order.
    pub fn broadcasts(&self) -> Vec<B256> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    fn query_guard(&self) -> Result<(), EngineError> {
        if self.state.lock().unwrap().fail_queries {
            return Err(EngineError::RpcError {
                chain_id: self.chain_id,
                rpc_url: "fake://primary".to_string(),
                message: "connection reset".to_string(),
                kind: unreachable_error(),
            });
        }
        Ok(())
    }
}

impl Chain for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn broadcast(&self, raw: &Bytes) -> Vec<NodeSendResult> {
        let mut state = self.state.lock().unwrap();
        // EIP-2718 transaction hash
        state.broadcasts.push(keccak256(raw));

        let result = match state.scripted_sends.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        vec![NodeSendResult {
            node: NODE.to_string(),
            result,
        }]
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, EngineError> {
        self.query_guard()?;
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, EngineError> {
        self.query_guard()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .tx_counts
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, EngineError> {
        self.query_guard()?;
        let state = self.state.lock().unwrap();
        if number > state.head {
            return Ok(None);
        }
        Ok(state.canonical.get(&number).copied())
    }

    async fn latest_head(&self) -> Result<Head, EngineError> {
        self.query_guard()?;
        Ok(self.head())
    }
}

// --- Fees ---

/// Fixed quote, bumps by a percentage up to a cap.
pub struct FakeFees {
    pub base: FeeParams,
    pub bump_percent: u32,
    cap: Mutex<u128>,
    fail_quotes: Mutex<bool>,
}

impl FakeFees {
    pub fn new(cap: u128) -> Self {
        Self {
            base: FeeParams::new(1_000, 100),
            bump_percent: 120,
            cap: Mutex::new(cap),
            fail_quotes: Mutex::new(false),
        }
    }

    pub fn set_cap(&self, cap: u128) {
        *self.cap.lock().unwrap() = cap;
    }

    fn cap(&self) -> u128 {
        *self.cap.lock().unwrap()
    }

    pub fn fail_quotes(&self, fail: bool) {
        *self.fail_quotes.lock().unwrap() = fail;
    }
}

impl FeeEstimator for FakeFees {
    async fn quote(&self, urgency: Urgency) -> Result<FeeParams, FeeError> {
        if *self.fail_quotes.lock().unwrap() {
            return Err(FeeError::Estimation(EngineError::InternalError {
                message: "fee oracle down".to_string(),
            }));
        }
        match urgency {
            Urgency::Normal => Ok(self.base),
            Urgency::High => bump_fee(&self.base, self.bump_percent, self.cap()),
        }
    }

    async fn bump(&self, previous: &FeeParams) -> Result<FeeParams, FeeError> {
        bump_fee(previous, self.bump_percent, self.cap())
    }
}

// --- Heads ---

/// Head source fed by the test.
#[derive(Default)]
pub struct ManualHeads {
    sender: Mutex<Option<mpsc::Sender<Head>>>,
}

impl ManualHeads {
    pub async fn push(&self, head: Head) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender.send(head).await.expect("head loop stopped");
        }
    }
}

impl HeadSource for ManualHeads {
    fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Head> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        *self.sender.lock().unwrap() = Some(tx);
        rx
    }
}

// --- Harness ---

pub type TestManager = EvmTxManager<MemoryTxStore, FakeChain, FakeFees, LocalKeySigner, ManualHeads>;

pub struct Harness {
    pub key: Address,
    pub signer: Arc<LocalKeySigner>,
    pub store: Arc<MemoryTxStore>,
    pub chain: Arc<FakeChain>,
    pub fees: Arc<FakeFees>,
    pub heads: Arc<ManualHeads>,
    pub manager: TestManager,
}

pub fn test_config(key: Address) -> TxmConfig {
    TxmConfig {
        keys: vec![key],
        max_in_flight: 16,
        max_queued: 16,
        bump_threshold: 3,
        max_bump_depth: 5,
        finality_depth: 10,
        broadcast_poll_ms: 20,
        resend_interval_ms: 50,
        reap_interval_ms: 60_000,
        ..TxmConfig::default()
    }
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut TxmConfig)) -> Self {
        let wallet = PrivateKeySigner::random();
        let key = wallet.address();
        let mut signer = LocalKeySigner::new();
        signer.insert(wallet);

        Self::with_parts(
            key,
            Arc::new(signer),
            Arc::new(MemoryTxStore::new()),
            Arc::new(FakeChain::new(100)),
            configure,
        )
    }

    /// A second manager over the same store, signer and chain, as after a restart.
    pub fn restarted(&self, configure: impl FnOnce(&mut TxmConfig)) -> Self {
        Self::with_parts(
            self.key,
            self.signer.clone(),
            self.store.clone(),
            self.chain.clone(),
            configure,
        )
    }

    fn with_parts(
        key: Address,
        signer: Arc<LocalKeySigner>,
        store: Arc<MemoryTxStore>,
        chain: Arc<FakeChain>,
        configure: impl FnOnce(&mut TxmConfig),
    ) -> Self {
        let mut config = test_config(key);
        configure(&mut config);

        let fees = Arc::new(FakeFees::new(1_000_000));
        let heads = Arc::new(ManualHeads::default());
        let manager = EvmTxManager::new(
            store.clone(),
            chain.clone(),
            fees.clone(),
            signer.clone(),
            heads.clone(),
            config,
        )
        .expect("manager");

        Self {
            key,
            signer,
            store,
            chain,
            fees,
            heads,
            manager,
        }
    }

    pub fn request(&self) -> SubmitRequest {
        SubmitRequest {
            key: self.key,
            to: Address::repeat_byte(0x42),
            value: U256::from(1u64),
            data: Bytes::from_static(b"\x01\x02"),
            confirmation_depth: 0,
            gas_limit: None,
        }
    }

    pub fn request_with_depth(&self, confirmation_depth: u64) -> SubmitRequest {
        SubmitRequest {
            confirmation_depth,
            ..self.request()
        }
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub type TestChainManager =
    ChainTxManager<MemoryTxStore, FakeChain, FakeFees, LocalKeySigner, ManualHeads>;
