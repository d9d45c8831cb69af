use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Lifecycle of an operation.
///
/// Forward progress is `Unstarted -> InFlight -> Confirmed -> Finalized`. `FatalError`
/// absorbs, and `Confirmed -> InFlight` only happens through reorg reconciliation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Unstarted,
    InFlight,
    Confirmed,
    Finalized,
    FatalError,
}

impl OperationState {
    pub const ALL: [OperationState; 5] = [
        OperationState::Unstarted,
        OperationState::InFlight,
        OperationState::Confirmed,
        OperationState::Finalized,
        OperationState::FatalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Unstarted => "unstarted",
            OperationState::InFlight => "in_flight",
            OperationState::Confirmed => "confirmed",
            OperationState::Finalized => "finalized",
            OperationState::FatalError => "fatal_error",
        }
    }

    /// Eligible for reaping once past the retention window.
    pub fn is_reapable(&self) -> bool {
        matches!(
            self,
            OperationState::Confirmed | OperationState::Finalized | OperationState::FatalError
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation ended in [`OperationState::FatalError`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "reason")]
pub enum FatalReason {
    /// The key cannot pay for the attempt.
    InsufficientFunds { message: String },
    /// The node rejected the payload itself.
    Malformed { message: String },
    /// Stuck beyond the maximum bump depth, or the fee estimator hit its cap.
    FeeBumpExhausted { bumps: u32 },
    /// The attempt could not be signed.
    SigningFailed { message: String },
    /// Cancelled by the caller before a nonce was assigned.
    Cancelled,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalReason::InsufficientFunds { message } => {
                write!(f, "insufficient funds: {message}")
            }
            FatalReason::Malformed { message } => write!(f, "malformed transaction: {message}"),
            FatalReason::FeeBumpExhausted { bumps } => {
                write!(f, "fee bump exhausted after {bumps} bumps")
            }
            FatalReason::SigningFailed { message } => write!(f, "signing failed: {message}"),
            FatalReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// EIP-1559 fee parameters of one attempt, in wei.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeeParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl FeeParams {
    pub fn new(max_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }

    /// Both components are strictly higher, which is what nodes require of a replacement.
    pub fn is_strictly_above(&self, other: &FeeParams) -> bool {
        self.max_fee_per_gas > other.max_fee_per_gas
            && self.max_priority_fee_per_gas > other.max_priority_fee_per_gas
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    /// `false` when execution reverted.
    pub status: bool,
    pub gas_used: u64,
}

/// One logical request to change on-chain state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub chain_id: u64,
    pub key: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub confirmation_depth: u64,
    pub state: OperationState,
    pub nonce: Option<u64>,
    pub bump_count: u32,
    pub reverted: bool,
    pub fatal_reason: Option<FatalReason>,
    pub receipt: Option<TxReceipt>,
    pub created_at: u64, // Unix timestamp in milliseconds
    pub updated_at: u64, // Unix timestamp in milliseconds
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Live, waiting for inclusion.
    Active,
    /// Replaced by a fee bump. Still watched, an older attempt can be the one mined.
    Superseded,
    /// A receipt was observed for this attempt.
    Included,
    /// A sibling attempt was included.
    Dead,
}

/// What one node said about one broadcast.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "outcome")]
pub enum SendOutcome {
    Accepted,
    AlreadyKnown,
    Rejected { message: String },
    Unreachable { message: String },
}

impl SendOutcome {
    /// The node holds the transaction.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted | SendOutcome::AlreadyKnown)
    }
}

/// One concrete signed submission of an operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub operation_id: String,
    pub attempt_number: u32,
    pub hash: B256,
    pub nonce: u64,
    pub fee: FeeParams,
    pub raw: Bytes,
    pub state: AttemptState,
    pub created_at: u64,
    pub broadcast_at: Option<u64>,
    /// Head number when the attempt was first broadcast.
    pub broadcast_block: Option<u64>,
    /// Node name -> last outcome
    pub send_outcomes: BTreeMap<String, SendOutcome>,
    pub receipt: Option<TxReceipt>,
}

impl Attempt {
    /// At least one node has confirmed holding this attempt.
    pub fn was_accepted(&self) -> bool {
        self.send_outcomes.values().any(SendOutcome::is_accepted)
    }

    pub fn is_watched(&self) -> bool {
        matches!(
            self.state,
            AttemptState::Active | AttemptState::Superseded | AttemptState::Included
        )
    }
}

/// Caller-facing status of an operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Unstarted,
    InFlight,
    Confirmed,
    Reverted,
    Finalized,
    FatalError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub id: String,
    pub status: OperationStatus,
    pub nonce: Option<u64>,
    pub reverted: bool,
    pub receipt: Option<TxReceipt>,
    pub fatal_reason: Option<FatalReason>,
}

impl From<&Operation> for StatusReport {
    fn from(op: &Operation) -> Self {
        let status = match op.state {
            OperationState::Unstarted => OperationStatus::Unstarted,
            OperationState::InFlight => OperationStatus::InFlight,
            OperationState::Confirmed if op.reverted => OperationStatus::Reverted,
            OperationState::Confirmed => OperationStatus::Confirmed,
            OperationState::Finalized => OperationStatus::Finalized,
            OperationState::FatalError => OperationStatus::FatalError,
        };

        StatusReport {
            id: op.id.clone(),
            status,
            nonce: op.nonce,
            reverted: op.reverted,
            receipt: op.receipt.clone(),
            fatal_reason: op.fatal_reason.clone(),
        }
    }
}

/// The request accepted by `submit`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub key: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub confirmation_depth: u64,

    #[serde(alias = "gas", default)]
    pub gas_limit: Option<u64>,
}
