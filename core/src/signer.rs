use std::collections::HashMap;

use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope},
    eips::eip2718::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, B256, Bytes, TxKind, U256},
    signers::local::PrivateKeySigner,
};

use crate::{error::EngineError, transaction::FeeParams};

/// Everything needed to produce one signed attempt.
#[derive(Debug, Clone)]
pub struct UnsignedAttempt {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fee: FeeParams,
}

#[derive(Debug, Clone)]
pub struct SignedAttempt {
    pub hash: B256,
    pub raw: Bytes,
}

/// Turns an unsigned attempt into broadcastable bytes.
pub trait AttemptSigner: Send + Sync + 'static {
    fn sign_attempt(
        &self,
        attempt: &UnsignedAttempt,
    ) -> impl Future<Output = Result<SignedAttempt, EngineError>> + Send;
}

/// Signs EIP-1559 attempts with private keys held in memory.
#[derive(Clone, Default)]
pub struct LocalKeySigner {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeySigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses hex private keys, with or without the `0x` prefix.
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, EngineError> {
        let mut signer = Self::new();
        for key in keys {
            let key: PrivateKeySigner =
                key.as_ref()
                    .trim()
                    .parse()
                    .map_err(|e| EngineError::SigningError {
                        message: format!("Failed to parse private key: {e}"),
                    })?;
            signer.insert(key);
        }
        Ok(signer)
    }

    pub fn insert(&mut self, key: PrivateKeySigner) {
        self.keys.insert(key.address(), key);
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }
}

impl AttemptSigner for LocalKeySigner {
    async fn sign_attempt(&self, attempt: &UnsignedAttempt) -> Result<SignedAttempt, EngineError> {
        let key = self
            .keys
            .get(&attempt.from)
            .ok_or_else(|| EngineError::SigningError {
                message: format!("No private key loaded for {}", attempt.from),
            })?;

        let mut tx = TxEip1559 {
            chain_id: attempt.chain_id,
            nonce: attempt.nonce,
            gas_limit: attempt.gas_limit,
            max_fee_per_gas: attempt.fee.max_fee_per_gas,
            max_priority_fee_per_gas: attempt.fee.max_priority_fee_per_gas,
            to: TxKind::Call(attempt.to),
            value: attempt.value,
            access_list: Default::default(),
            input: attempt.data.clone(),
        };

        let signature = key
            .sign_transaction_sync(&mut tx)
            .map_err(|e| EngineError::SigningError {
                message: format!("Failed to sign transaction: {e}"),
            })?;

        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let envelope = TxEnvelope::from(signed);

        Ok(SignedAttempt {
            hash,
            raw: envelope.encoded_2718().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(from: Address, fee: FeeParams) -> UnsignedAttempt {
        UnsignedAttempt {
            chain_id: 1,
            from,
            to: Address::repeat_byte(0x11),
            value: U256::from(1),
            data: Bytes::new(),
            nonce: 7,
            gas_limit: 21_000,
            fee,
        }
    }

    #[tokio::test]
    async fn fee_changes_the_hash() {
        let key = PrivateKeySigner::random();
        let from = key.address();
        let mut signer = LocalKeySigner::new();
        signer.insert(key);

        let first = signer
            .sign_attempt(&attempt(from, FeeParams::new(100, 10)))
            .await
            .unwrap();
        let bumped = signer
            .sign_attempt(&attempt(from, FeeParams::new(120, 12)))
            .await
            .unwrap();

        assert_ne!(first.hash, bumped.hash);
        assert!(!first.raw.is_empty());
    }

    #[tokio::test]
    async fn unknown_key_is_a_signing_error() {
        let signer = LocalKeySigner::new();
        let err = signer
            .sign_attempt(&attempt(Address::repeat_byte(0x22), FeeParams::new(1, 1)))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::SigningError { .. }));
    }
}
