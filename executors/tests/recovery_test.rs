mod fixtures;
use fixtures::*;

use std::time::Duration;

use txm_core::transaction::{OperationState, OperationStatus};
use txm_executors::{
    metrics::export_default_metrics,
    txm::{NullTxManager, ObservedTxManager, TransactionManager, TxManagerRegistry, TxStore, TxmError},
};

#[tokio::test]
async fn test_restart_sends_persisted_attempt_without_new_nonce() {
    setup_tracing();
    let h = Harness::new(|_| {});

    // Persisted and in flight, but the only node never got it
    h.chain.fail_next_send(unreachable_error());
    let first = h.manager.submit(h.request()).await.unwrap();
    h.manager.worker().broadcast_pass(h.key).await.unwrap();
    let attempt = h.store.get_attempts(&first).await.unwrap()[0].clone();
    assert!(!attempt.was_accepted());

    let restarted = h.restarted(|_| {});
    restarted.manager.start().await.unwrap();

    assert_eq!(h.chain.broadcasts(), vec![attempt.hash, attempt.hash]);
    let attempts = h.store.get_attempts(&first).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].was_accepted());

    let second = restarted.manager.submit(restarted.request()).await.unwrap();
    let manager = &restarted.manager;
    assert!(
        eventually(|| async {
            manager.status(&second).await.unwrap().status == OperationStatus::InFlight
        })
        .await
    );
    assert_eq!(manager.status(&second).await.unwrap().nonce, Some(1));

    restarted.manager.close().await.unwrap();
}

#[tokio::test]
async fn test_started_manager_confirms_from_head_stream() {
    let h = Harness::new(|_| {});
    h.manager.start().await.unwrap();

    let id = h.manager.submit(h.request()).await.unwrap();
    let manager = &h.manager;
    assert!(
        eventually(|| async {
            manager.status(&id).await.unwrap().status == OperationStatus::InFlight
        })
        .await
    );

    let hash = h.store.get_attempts(&id).await.unwrap()[0].hash;
    h.chain.advance_to(101);
    h.chain.mine(hash, 101, true);
    h.heads.push(h.chain.head()).await;

    assert!(
        eventually(|| async {
            manager.status(&id).await.unwrap().status == OperationStatus::Confirmed
        })
        .await
    );
    assert_eq!(h.manager.worker().latest_head().map(|head| head.number), Some(101));

    assert!(matches!(h.manager.start().await, Err(TxmError::AlreadyStarted)));
    h.manager.close().await.unwrap();
    // Closing twice is harmless
    h.manager.close().await.unwrap();
}

#[tokio::test]
async fn test_resend_loop_retries_unaccepted_attempt() {
    let h = Harness::new(|c| c.resend_interval_ms = 20);
    h.chain.fail_next_send(unreachable_error());
    h.manager.start().await.unwrap();

    let id = h.manager.submit(h.request()).await.unwrap();
    let store = &h.store;
    assert!(
        eventually(|| async {
            store
                .get_attempts(&id)
                .await
                .unwrap()
                .first()
                .is_some_and(|attempt| attempt.was_accepted())
        })
        .await
    );

    h.manager.close().await.unwrap();
}

#[tokio::test]
async fn test_reap_removes_only_expired_terminal_operations() {
    let h = Harness::new(|c| c.reap_retention_secs = 0);
    let worker = h.manager.worker();

    let confirmed = h.manager.submit(h.request()).await.unwrap();
    let cancelled = h.manager.submit(h.request()).await.unwrap();
    h.manager.cancel(&cancelled).await.unwrap();
    worker.broadcast_pass(h.key).await.unwrap();
    let pending = h.manager.submit(h.request()).await.unwrap();
    worker.broadcast_pass(h.key).await.unwrap();

    let hash = h.store.get_attempts(&confirmed).await.unwrap()[0].hash;
    h.chain.advance_to(101);
    h.chain.mine(hash, 101, true);
    worker.process_head(h.chain.head()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = worker.reap_pass().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total(), 2);

    assert!(matches!(
        h.manager.status(&confirmed).await,
        Err(TxmError::NotFound { .. })
    ));
    assert!(h.store.get_attempts(&confirmed).await.unwrap().is_empty());
    assert_eq!(
        h.manager.status(&pending).await.unwrap().status,
        OperationStatus::InFlight
    );
    assert_eq!(
        h.store
            .operations_in_state(OperationState::InFlight)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_retention_window_keeps_recent_operations() {
    let h = Harness::new(|_| {});
    let id = h.manager.submit(h.request()).await.unwrap();
    h.manager.cancel(&id).await.unwrap();

    let report = h.manager.worker().reap_pass().await.unwrap();
    assert_eq!(report.total(), 0);
    assert!(h.manager.status(&id).await.is_ok());
}

#[tokio::test]
async fn test_disabled_chain_rejects_every_call() {
    let h = Harness::new(|_| {});
    let manager = TestChainManager::Disabled(NullTxManager::new(42));

    manager.start().await.unwrap();

    match manager.submit(h.request()).await {
        Err(TxmError::ChainDisabled { chain_id, message }) => {
            assert_eq!(chain_id, 42);
            assert_eq!(message, "Ethereum is disabled for chain 42");
        }
        other => panic!("expected disabled chain, got {other:?}"),
    }
    assert!(matches!(
        manager.status("any").await,
        Err(TxmError::ChainDisabled { .. })
    ));
    assert!(matches!(
        manager.resync_key(h.key).await,
        Err(TxmError::ChainDisabled { .. })
    ));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_observed_manager_records_calls() {
    let observed = ObservedTxManager::new(NullTxManager::new(7_001));
    let h = Harness::new(|_| {});

    assert!(observed.submit(h.request()).await.is_err());
    observed.start().await.unwrap();

    let exported = export_default_metrics().unwrap();
    assert!(exported.contains(r#"txm_call_total{chain_id="7001",method="submit",success="false"} 1"#));
    assert!(exported.contains(r#"txm_call_total{chain_id="7001",method="start",success="true"} 1"#));
    assert!(exported.contains("txm_call_duration_seconds"));
}

#[tokio::test]
async fn test_registry_routes_by_chain() {
    let h = Harness::new(|_| {});
    let request = h.request();
    let disabled_request = request.clone();

    let mut registry = TxManagerRegistry::new();
    registry
        .register(TestChainManager::Enabled(h.manager))
        .unwrap();
    registry
        .register(TestChainManager::Disabled(NullTxManager::new(1)))
        .unwrap();

    assert_eq!(registry.chain_ids(), vec![1, CHAIN_ID]);
    registry.start_all().await.unwrap();

    let enabled = registry.get(CHAIN_ID).unwrap();
    let id = enabled.submit(request).await.unwrap();
    assert!(enabled.status(&id).await.is_ok());
    assert!(matches!(
        registry.get(1).unwrap().submit(disabled_request).await,
        Err(TxmError::ChainDisabled { chain_id: 1, .. })
    ));
    assert!(registry.get(10).is_err());

    registry.close_all().await.unwrap();
}
