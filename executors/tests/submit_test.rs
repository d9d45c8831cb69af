mod fixtures;
use fixtures::*;

use std::sync::Arc;

use futures::future::join_all;
use txm_core::transaction::{FatalReason, OperationState, OperationStatus};
use txm_executors::txm::{SubmitRejection, TransactionManager, TxStore, TxmError};

#[tokio::test]
async fn test_in_flight_limit_rejects_third_submission() {
    setup_tracing();
    let h = Harness::new(|c| c.max_in_flight = 2);
    h.chain.set_transaction_count(h.key, 7);

    let first = h.manager.submit(h.request()).await.unwrap();
    let second = h.manager.submit(h.request()).await.unwrap();
    let third = h.manager.submit(h.request()).await;

    assert!(matches!(
        third,
        Err(TxmError::Rejected(SubmitRejection::InFlightLimit { limit: 2, .. }))
    ));

    let report = h.manager.worker().broadcast_pass(h.key).await.unwrap();
    assert_eq!(report.started, 2);

    let first = h.manager.status(&first).await.unwrap();
    let second = h.manager.status(&second).await.unwrap();
    assert_eq!(first.status, OperationStatus::InFlight);
    assert_eq!(first.nonce, Some(7));
    assert_eq!(second.nonce, Some(8));

    // In-flight operations still count against the limit
    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Rejected(SubmitRejection::InFlightLimit { .. }))
    ));

    let ops = h
        .store
        .operations_for_key(h.key, OperationState::InFlight)
        .await
        .unwrap();
    assert_eq!(ops.len(), 2);
}

#[tokio::test]
async fn test_queue_limit_applies_to_unstarted_only() {
    let h = Harness::new(|c| {
        c.max_in_flight = 10;
        c.max_queued = 1;
    });

    h.manager.submit(h.request()).await.unwrap();
    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Rejected(SubmitRejection::QueueLimit { limit: 1, .. }))
    ));

    h.manager.worker().broadcast_pass(h.key).await.unwrap();
    h.manager.submit(h.request()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_get_contiguous_nonces() {
    setup_tracing();
    let h = Arc::new(Harness::new(|c| {
        c.max_in_flight = 64;
        c.max_queued = 64;
    }));
    h.chain.set_transaction_count(h.key, 3);

    let submissions = (0..20).map(|_| {
        let h = h.clone();
        async move { h.manager.submit(h.request()).await }
    });
    let ids: Vec<String> = join_all(submissions)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    // Two overlapping passes must not hand out the same nonce twice
    let worker = h.manager.worker();
    let (a, b) = tokio::join!(worker.broadcast_pass(h.key), worker.broadcast_pass(h.key));
    assert_eq!(a.unwrap().started + b.unwrap().started, 20);

    let mut nonces = Vec::new();
    for id in &ids {
        nonces.push(h.manager.status(id).await.unwrap().nonce.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (3..23).collect::<Vec<u64>>());
    assert_eq!(h.store.next_nonce(h.key).await.unwrap(), Some(23));
}

#[tokio::test]
async fn test_nonces_follow_submission_order() {
    let h = Harness::new(|_| {});

    let ids = [
        h.manager.submit(h.request()).await.unwrap(),
        h.manager.submit(h.request()).await.unwrap(),
        h.manager.submit(h.request()).await.unwrap(),
    ];
    h.manager.worker().broadcast_pass(h.key).await.unwrap();

    for (expected, id) in ids.iter().enumerate() {
        let status = h.manager.status(id).await.unwrap();
        assert_eq!(status.nonce, Some(expected as u64));
    }
}

#[tokio::test]
async fn test_unknown_key_is_rejected() {
    let h = Harness::new(|_| {});
    let mut request = h.request();
    request.key = alloy::primitives::Address::repeat_byte(0x99);

    assert!(matches!(
        h.manager.submit(request).await,
        Err(TxmError::Rejected(SubmitRejection::KeyDisabled { .. }))
    ));
}

#[tokio::test]
async fn test_default_gas_limit_applies() {
    let h = Harness::new(|c| c.default_gas_limit = 90_000);

    let defaulted = h.manager.submit(h.request()).await.unwrap();
    let mut request = h.request();
    request.gas_limit = Some(21_000);
    let explicit = h.manager.submit(request).await.unwrap();

    let defaulted = h.store.get_operation(&defaulted).await.unwrap().unwrap();
    let explicit = h.store.get_operation(&explicit).await.unwrap().unwrap();
    assert_eq!(defaulted.gas_limit, 90_000);
    assert_eq!(explicit.gas_limit, 21_000);
}

#[tokio::test]
async fn test_fee_quote_failure_keeps_queue_order() {
    let h = Harness::new(|_| {});
    let first = h.manager.submit(h.request()).await.unwrap();
    let second = h.manager.submit(h.request()).await.unwrap();

    h.fees.fail_quotes(true);
    let report = h.manager.worker().broadcast_pass(h.key).await.unwrap();
    assert_eq!(report.started, 0);
    assert_eq!(
        h.manager.status(&first).await.unwrap().status,
        OperationStatus::Unstarted
    );

    h.fees.fail_quotes(false);
    h.manager.worker().broadcast_pass(h.key).await.unwrap();
    assert_eq!(h.manager.status(&first).await.unwrap().nonce, Some(0));
    assert_eq!(h.manager.status(&second).await.unwrap().nonce, Some(1));
}

#[tokio::test]
async fn test_cancel_only_before_nonce_assignment() {
    let h = Harness::new(|_| {});
    let queued = h.manager.submit(h.request()).await.unwrap();

    h.manager.cancel(&queued).await.unwrap();
    let status = h.manager.status(&queued).await.unwrap();
    assert_eq!(status.status, OperationStatus::FatalError);
    assert_eq!(status.fatal_reason, Some(FatalReason::Cancelled));

    let sent = h.manager.submit(h.request()).await.unwrap();
    let report = h.manager.worker().broadcast_pass(h.key).await.unwrap();
    assert_eq!(report.started, 1);

    // The cancelled operation never took a nonce
    assert_eq!(h.manager.status(&sent).await.unwrap().nonce, Some(0));
    assert!(matches!(
        h.manager.cancel(&sent).await,
        Err(TxmError::NotCancellable {
            state: OperationState::InFlight,
            ..
        })
    ));
    assert!(matches!(
        h.manager.cancel("missing").await,
        Err(TxmError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_disable_key_waits_for_pending_operations() {
    let h = Harness::new(|_| {});
    let id = h.manager.submit(h.request()).await.unwrap();

    assert!(matches!(
        h.manager.disable_key(h.key).await,
        Err(TxmError::KeyBusy { pending: 1, .. })
    ));

    h.manager.cancel(&id).await.unwrap();
    h.manager.disable_key(h.key).await.unwrap();
    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Rejected(SubmitRejection::KeyDisabled { .. }))
    ));

    h.manager.enable_key(h.key).await.unwrap();
    h.manager.submit(h.request()).await.unwrap();
}

#[tokio::test]
async fn test_out_of_sync_key_pauses_until_resync() {
    let h = Harness::new(|_| {});
    h.store.set_next_nonce(h.key, 3).await.unwrap();
    h.chain.set_transaction_count(h.key, 10);

    let sync = h.manager.worker().nonces.recover(h.key).await.unwrap();
    assert!(!sync.in_sync);

    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Rejected(SubmitRejection::KeyOutOfSync { .. }))
    ));

    assert_eq!(h.manager.resync_key(h.key).await.unwrap(), 10);
    let id = h.manager.submit(h.request()).await.unwrap();
    h.manager.worker().broadcast_pass(h.key).await.unwrap();
    assert_eq!(h.manager.status(&id).await.unwrap().nonce, Some(10));
}

#[tokio::test]
async fn test_store_outage_halts_manager() {
    let h = Harness::new(|_| {});
    h.store.set_unavailable(true);

    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Store { .. })
    ));
    assert!(h.manager.worker().is_halted());
    assert!(h.manager.worker().shutdown.is_cancelled());

    h.store.set_unavailable(false);
    assert!(matches!(
        h.manager.submit(h.request()).await,
        Err(TxmError::Halted { .. })
    ));
    assert!(matches!(h.manager.start().await, Err(TxmError::Halted { .. })));
}
