use std::collections::{BTreeMap, HashMap};

use ::redis::{AsyncCommands, Pipeline, aio::ConnectionManager};
use alloy::primitives::{Address, B256};
use txm_core::transaction::{Attempt, Operation, OperationState, SendOutcome};

use super::{OperationUpdate, PendingCounts, TransactionStoreError, TxStore};

const MAX_RETRIES: u32 = 10;
const RETRY_BASE_DELAY_MS: u64 = 10;

/// Field of the sends hash holding the first broadcast timestamp.
const BROADCAST_AT_FIELD: &str = "@broadcast_at";

pub struct TxStoreKeys {
    pub chain_id: u64,
    pub namespace: Option<String>,
}

impl TxStoreKeys {
    pub fn new(chain_id: u64, namespace: Option<String>) -> Self {
        Self {
            chain_id,
            namespace,
        }
    }

    /// Operation record, a JSON string
    pub fn operation_key_name(&self, operation_id: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:op:{}:{operation_id}", self.chain_id),
            None => format!("txm:op:{}:{operation_id}", self.chain_id),
        }
    }

    /// Hash of attempt hash -> attempt JSON.
    ///
    /// Send outcomes are kept out of this hash so the resender can record them without
    /// rewriting the attempt.
    pub fn attempts_hashmap_name(&self, operation_id: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:attempts:{}:{operation_id}", self.chain_id),
            None => format!("txm:attempts:{}:{operation_id}", self.chain_id),
        }
    }

    /// Hash of node name -> send outcome JSON for one attempt, plus the first broadcast time
    pub fn sends_hashmap_name(&self, hash: &B256) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:sends:{}:{hash}", self.chain_id),
            None => format!("txm:sends:{}:{hash}", self.chain_id),
        }
    }

    /// Zset of operation ids in one state, scored by `updated_at`
    pub fn state_zset_name(&self, state: OperationState) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:state:{}:{state}", self.chain_id),
            None => format!("txm:state:{}:{state}", self.chain_id),
        }
    }

    /// Zset of one key's operation ids in one state, scored by submission sequence
    pub fn key_state_zset_name(&self, key: &Address, state: OperationState) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:key_state:{}:{key}:{state}", self.chain_id),
            None => format!("txm:key_state:{}:{key}:{state}", self.chain_id),
        }
    }

    /// Submission counter used to keep per-key FIFO order
    pub fn sequence_key_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:seq:{}", self.chain_id),
            None => format!("txm:seq:{}", self.chain_id),
        }
    }

    /// Next nonce to assign for a key
    pub fn nonce_key_name(&self, key: &Address) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:nonce:{}:{key}", self.chain_id),
            None => format!("txm:nonce:{}:{key}", self.chain_id),
        }
    }
}

trait SafeRedisTransaction: Send + Sync {
    type ValidationData;
    type OperationResult;

    fn name(&self) -> &str;
    fn operation(
        &self,
        pipeline: &mut Pipeline,
        validation_data: Self::ValidationData,
    ) -> Self::OperationResult;
    fn validation(
        &self,
        conn: &mut ConnectionManager,
    ) -> impl Future<Output = Result<Self::ValidationData, TransactionStoreError>> + Send;
    fn watch_keys(&self) -> Vec<String>;
}

async fn load_operation(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<Option<Operation>, TransactionStoreError> {
    let json: Option<String> = conn.get(key).await?;
    json.map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(Into::into)
}

struct CommitOperation<'a> {
    keys: &'a TxStoreKeys,
    update: &'a OperationUpdate,
    operation_json: String,
    attempt_jsons: Vec<(String, String)>,
}

impl SafeRedisTransaction for CommitOperation<'_> {
    type ValidationData = f64;
    type OperationResult = ();

    fn name(&self) -> &str {
        "commit operation"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.operation_key_name(&self.update.operation.id)]
    }

    async fn validation(&self, conn: &mut ConnectionManager) -> Result<f64, TransactionStoreError> {
        let op = &self.update.operation;
        let current = load_operation(conn, &self.keys.operation_key_name(&op.id))
            .await?
            .ok_or_else(|| TransactionStoreError::OperationNotFound {
                operation_id: op.id.clone(),
            })?;

        if current.state != self.update.expected_state {
            return Err(TransactionStoreError::StateConflict {
                operation_id: op.id.clone(),
                expected: self.update.expected_state,
                actual: current.state,
            });
        }

        let sequence: Option<f64> = conn
            .zscore(
                self.keys.key_state_zset_name(&current.key, current.state),
                &op.id,
            )
            .await?;

        Ok(sequence.unwrap_or(op.created_at as f64))
    }

    fn operation(&self, pipeline: &mut Pipeline, sequence: f64) {
        let op = &self.update.operation;
        let from = self.update.expected_state;

        pipeline.set(self.keys.operation_key_name(&op.id), &self.operation_json);

        pipeline.zrem(self.keys.state_zset_name(from), &op.id);
        pipeline.zrem(self.keys.key_state_zset_name(&op.key, from), &op.id);
        pipeline.zadd(self.keys.state_zset_name(op.state), &op.id, op.updated_at);
        pipeline.zadd(
            self.keys.key_state_zset_name(&op.key, op.state),
            &op.id,
            sequence,
        );

        let attempts_key = self.keys.attempts_hashmap_name(&op.id);
        for hash in &self.update.removed_attempts {
            pipeline.hdel(&attempts_key, hash.to_string());
            pipeline.del(self.keys.sends_hashmap_name(hash));
        }
        for (hash, json) in &self.attempt_jsons {
            pipeline.hset(&attempts_key, hash, json);
        }

        if let Some(next_nonce) = self.update.next_nonce {
            pipeline.set(self.keys.nonce_key_name(&op.key), next_nonce);
        }
    }
}

struct DeleteOperation<'a> {
    keys: &'a TxStoreKeys,
    operation_id: &'a str,
    expected_state: OperationState,
}

impl SafeRedisTransaction for DeleteOperation<'_> {
    /// The operation and the hashes of its attempts, `None` if there is nothing to delete
    type ValidationData = Option<(Operation, Vec<String>)>;
    type OperationResult = bool;

    fn name(&self) -> &str {
        "delete operation"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.operation_key_name(self.operation_id),
            self.keys.attempts_hashmap_name(self.operation_id),
        ]
    }

    async fn validation(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Self::ValidationData, TransactionStoreError> {
        let Some(op) =
            load_operation(conn, &self.keys.operation_key_name(self.operation_id)).await?
        else {
            return Ok(None);
        };

        if op.state != self.expected_state {
            return Ok(None);
        }

        let hashes: Vec<String> = conn
            .hkeys(self.keys.attempts_hashmap_name(self.operation_id))
            .await?;
        Ok(Some((op, hashes)))
    }

    fn operation(&self, pipeline: &mut Pipeline, data: Self::ValidationData) -> bool {
        let Some((op, hashes)) = data else {
            return false;
        };

        pipeline.del(self.keys.operation_key_name(&op.id));
        pipeline.del(self.keys.attempts_hashmap_name(&op.id));
        for hash in hashes {
            match hash.parse::<B256>() {
                Ok(hash) => {
                    pipeline.del(self.keys.sends_hashmap_name(&hash));
                }
                Err(e) => {
                    tracing::warn!(operation_id = %op.id, hash = %hash, error = %e, "Skipping unparseable attempt hash");
                }
            }
        }
        pipeline.zrem(self.keys.state_zset_name(op.state), &op.id);
        pipeline.zrem(self.keys.key_state_zset_name(&op.key, op.state), &op.id);
        true
    }
}

/// [`TxStore`] on Redis.
///
/// Every state transition is a WATCH/MULTI/EXEC transaction on the operation record, so a
/// concurrent writer that moved the operation first makes the transaction abort and the
/// state check fail on retry.
#[derive(Clone)]
pub struct RedisTxStore {
    redis: ConnectionManager,
    keys: std::sync::Arc<TxStoreKeys>,
}

impl RedisTxStore {
    pub fn new(redis: ConnectionManager, chain_id: u64, namespace: Option<String>) -> Self {
        Self {
            redis,
            keys: std::sync::Arc::new(TxStoreKeys::new(chain_id, namespace)),
        }
    }

    pub fn keys(&self) -> &TxStoreKeys {
        &self.keys
    }

    async fn execute_with_watch_and_retry<T: SafeRedisTransaction>(
        &self,
        safe_tx: &T,
    ) -> Result<T::OperationResult, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let mut retry_count = 0;

        loop {
            if retry_count >= MAX_RETRIES {
                return Err(TransactionStoreError::WatchFailed);
            }

            if retry_count > 0 {
                let delay_ms = RETRY_BASE_DELAY_MS * (1 << (retry_count - 1).min(6));
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                tracing::debug!(
                    retry_count = retry_count,
                    delay_ms = delay_ms,
                    chain_id = self.keys.chain_id,
                    operation = safe_tx.name(),
                    "Retrying atomic operation"
                );
            }

            let mut watch_cmd = ::redis::cmd("WATCH");
            for key in safe_tx.watch_keys() {
                watch_cmd.arg(key);
            }
            let _: () = watch_cmd.query_async(&mut conn).await?;

            let validation_data = match safe_tx.validation(&mut conn).await {
                Ok(data) => data,
                Err(e) => {
                    let _: () = ::redis::cmd("UNWATCH").query_async(&mut conn).await?;
                    return Err(e);
                }
            };

            let mut pipeline = ::redis::pipe();
            pipeline.atomic();
            let result = safe_tx.operation(&mut pipeline, validation_data);

            // EXEC answers nil when a watched key changed
            let executed: Option<Vec<::redis::Value>> = pipeline.query_async(&mut conn).await?;
            match executed {
                Some(_) => return Ok(result),
                None => {
                    retry_count += 1;
                    continue;
                }
            }
        }
    }

    async fn load_operations(
        &self,
        ids: Vec<String>,
        state: OperationState,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.keys.operation_key_name(id))
            .collect();
        let jsons: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut operations = Vec::with_capacity(jsons.len());
        for json in jsons.into_iter().flatten() {
            let op: Operation = serde_json::from_str(&json)?;
            // Index entries can briefly lag the record between WATCH retries
            if op.state == state {
                operations.push(op);
            }
        }
        Ok(operations)
    }
}

impl TxStore for RedisTxStore {
    async fn insert_operation(&self, operation: &Operation) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let operation_json = serde_json::to_string(operation)?;
        let sequence: u64 = conn.incr(self.keys.sequence_key_name(), 1).await?;

        let mut pipeline = ::redis::pipe();
        pipeline.atomic();
        pipeline.set(self.keys.operation_key_name(&operation.id), operation_json);
        pipeline.zadd(
            self.keys.state_zset_name(operation.state),
            &operation.id,
            operation.updated_at,
        );
        pipeline.zadd(
            self.keys.key_state_zset_name(&operation.key, operation.state),
            &operation.id,
            sequence,
        );
        pipeline.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn get_operation(&self, id: &str) -> Result<Option<Operation>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        load_operation(&mut conn, &self.keys.operation_key_name(id)).await
    }

    async fn get_attempts(&self, operation_id: &str) -> Result<Vec<Attempt>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let stored: HashMap<String, String> = conn
            .hgetall(self.keys.attempts_hashmap_name(operation_id))
            .await?;

        let mut attempts = stored
            .values()
            .map(|json| serde_json::from_str::<Attempt>(json))
            .collect::<Result<Vec<_>, _>>()?;

        if attempts.is_empty() {
            return Ok(attempts);
        }

        let mut pipeline = ::redis::pipe();
        for attempt in &attempts {
            pipeline.hgetall(self.keys.sends_hashmap_name(&attempt.hash));
        }
        let sends: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await?;

        for (attempt, sends) in attempts.iter_mut().zip(sends) {
            for (field, value) in sends {
                if field == BROADCAST_AT_FIELD {
                    if attempt.broadcast_at.is_none() {
                        attempt.broadcast_at = value.parse().ok();
                    }
                    continue;
                }
                let outcome: SendOutcome = serde_json::from_str(&value)?;
                attempt.send_outcomes.insert(field, outcome);
            }
        }

        attempts.sort_by_key(|attempt| attempt.attempt_number);
        Ok(attempts)
    }

    async fn operations_in_state(
        &self,
        state: OperationState,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrange(self.keys.state_zset_name(state), 0, -1).await?;
        self.load_operations(ids, state).await
    }

    async fn operations_for_key(
        &self,
        key: Address,
        state: OperationState,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.keys.key_state_zset_name(&key, state), 0, -1)
            .await?;
        self.load_operations(ids, state).await
    }

    async fn operations_updated_before(
        &self,
        state: OperationState,
        cutoff_ms: u64,
    ) -> Result<Vec<Operation>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(
                self.keys.state_zset_name(state),
                "-inf",
                format!("({cutoff_ms}"),
            )
            .await?;
        self.load_operations(ids, state).await
    }

    async fn pending_counts(&self, key: Address) -> Result<PendingCounts, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let (unstarted, in_flight): (u64, u64) = ::redis::pipe()
            .zcard(self.keys.key_state_zset_name(&key, OperationState::Unstarted))
            .zcard(self.keys.key_state_zset_name(&key, OperationState::InFlight))
            .query_async(&mut conn)
            .await?;

        Ok(PendingCounts {
            unstarted,
            in_flight,
        })
    }

    async fn next_nonce(&self, key: Address) -> Result<Option<u64>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let nonce: Option<u64> = conn.get(self.keys.nonce_key_name(&key)).await?;
        Ok(nonce)
    }

    async fn set_next_nonce(&self, key: Address, nonce: u64) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.set(self.keys.nonce_key_name(&key), nonce).await?;
        Ok(())
    }

    async fn commit(&self, update: OperationUpdate) -> Result<(), TransactionStoreError> {
        let operation_json = serde_json::to_string(&update.operation)?;
        let attempt_jsons = update
            .attempts
            .iter()
            .map(|attempt| Ok((attempt.hash.to_string(), serde_json::to_string(attempt)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        self.execute_with_watch_and_retry(&CommitOperation {
            keys: &self.keys,
            update: &update,
            operation_json,
            attempt_jsons,
        })
        .await
    }

    async fn record_send_outcomes(
        &self,
        operation_id: &str,
        hash: B256,
        outcomes: &BTreeMap<String, SendOutcome>,
        broadcast_at: u64,
    ) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();

        let exists: bool = conn
            .hexists(self.keys.attempts_hashmap_name(operation_id), hash.to_string())
            .await?;
        if !exists {
            return Ok(());
        }

        let sends_key = self.keys.sends_hashmap_name(&hash);
        let previous: HashMap<String, String> = conn.hgetall(&sends_key).await?;

        let mut pipeline = ::redis::pipe();
        for (node, outcome) in outcomes {
            let keep_previous = !outcome.is_accepted()
                && previous
                    .get(node)
                    .and_then(|json| serde_json::from_str::<SendOutcome>(json).ok())
                    .is_some_and(|previous| previous.is_accepted());
            if !keep_previous {
                pipeline.hset(&sends_key, node, serde_json::to_string(outcome)?);
            }
        }
        pipeline.hset_nx(&sends_key, BROADCAST_AT_FIELD, broadcast_at);
        pipeline.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn delete_operation(
        &self,
        id: &str,
        expected_state: OperationState,
    ) -> Result<bool, TransactionStoreError> {
        self.execute_with_watch_and_retry(&DeleteOperation {
            keys: &self.keys,
            operation_id: id,
            expected_state,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_are_namespaced_per_chain() {
        let key = Address::repeat_byte(0xab);
        let keys = TxStoreKeys::new(137, Some("engine".to_string()));

        assert_eq!(keys.operation_key_name("op-1"), "engine:txm:op:137:op-1");
        assert_eq!(
            keys.state_zset_name(OperationState::InFlight),
            "engine:txm:state:137:in_flight"
        );
        assert_eq!(
            keys.nonce_key_name(&key),
            format!("engine:txm:nonce:137:{key}")
        );
    }

    #[test]
    fn key_names_without_namespace() {
        let keys = TxStoreKeys::new(1, None);
        assert_eq!(keys.attempts_hashmap_name("op-1"), "txm:attempts:1:op-1");
        assert_eq!(keys.sequence_key_name(), "txm:seq:1");
    }
}
