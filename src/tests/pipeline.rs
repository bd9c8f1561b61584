//! Store failure handling and concurrent ingestion

use super::helpers::*;
use crate::{
    connection::ConnState,
    error::SyncError,
    pipeline::ProcessOutcome,
    queue::{BackpressurePolicy, IngestQueue},
    store::{GraphStore, MemoryGraphStore, StoreConnectionManager},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use test_log::test;
use tokio::sync::mpsc;

#[test(tokio::test)]
async fn test_transient_failures_are_retried() {
    let store = FlakyStore::new();
    let pipeline = pipeline_for(store.clone());
    store.fail_next(2, SyncError::TransientStore("timeout".to_string()));

    let outcome = pipeline
        .process(value_message("site1/line1/temp", json!(1), 1))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied(_)), "{outcome:?}");
    assert_eq!(store.apply_calls(), 3);
    assert_eq!(pipeline.store().state().get(), ConnState::Connected);
    assert_eq!(store.inner().paths().len(), 3);
}

#[test(tokio::test)]
async fn test_store_outage_exhausts_then_probe_recovers() {
    let store = FlakyStore::new();
    let pipeline = pipeline_for(store.clone());
    let manager = pipeline.store().clone();
    manager.start().await.unwrap();
    assert!(manager.state().is_connected());

    store.set_down(true);
    let outcome = pipeline
        .process(value_message("site1/line1/temp", json!(1), 1))
        .await
        .unwrap();
    match outcome {
        ProcessOutcome::Failed(SyncError::ConnectionLost { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected the retry budget to run out, got {other:?}"),
    }
    assert_eq!(manager.state().get(), ConnState::Disconnected);
    assert_eq!(pipeline.stats().snapshot().failed, 1);
    assert!(manager.probe().await.is_err());
    assert_eq!(manager.state().get(), ConnState::Disconnected);

    store.set_down(false);
    manager.probe().await.unwrap();
    assert_eq!(manager.state().get(), ConnState::Connected);

    let outcome = pipeline
        .process(value_message("site1/line1/temp", json!(2), 2))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied(_)));
    let node = store.inner().node("site1/line1/temp").await.unwrap().unwrap();
    assert_eq!(node.value, Some(json!(2)));
}

#[test(tokio::test)]
async fn test_liveness_probe_reconnects_in_background() {
    let store = FlakyStore::new();
    let manager = manager_for(store.clone());
    store.set_down(true);
    assert!(matches!(
        manager.start().await,
        Err(SyncError::ConnectionLost { .. })
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let probe = manager.spawn_liveness_probe(Duration::from_millis(5), stop_rx);
    store.set_down(false);
    let state = tokio::time::timeout(
        Duration::from_secs(2),
        manager.state().wait_for(|s| *s == ConnState::Connected),
    )
    .await
    .unwrap();
    assert_eq!(state, ConnState::Connected);

    stop_tx.send(true).unwrap();
    probe.await.unwrap();
}

#[test(tokio::test)]
async fn test_non_transient_store_errors_are_not_retried() {
    let store = FlakyStore::new();
    let pipeline = pipeline_for(store.clone());
    store.fail_next(1, SyncError::Store("constraint violated".to_string()));

    let outcome = pipeline
        .process(value_message("a/b", json!(1), 1))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed(SyncError::Store(_))));
    assert_eq!(store.apply_calls(), 1);
    assert_eq!(store.inner().counts().await.unwrap(), (0, 0));
}

#[test(tokio::test)]
async fn test_rejected_credentials_are_fatal() {
    let store = FlakyStore::new();
    store.reject_credentials();
    let manager = manager_for(store.clone());
    assert!(matches!(
        manager.start().await,
        Err(SyncError::Authentication(_))
    ));

    let pipeline = pipeline_for(store.clone());
    store.fail_next(1, SyncError::Authentication("token expired".to_string()));
    let res = pipeline.process(value_message("a/b", json!(1), 1)).await;
    assert!(matches!(res, Err(SyncError::Authentication(_))));
    assert_eq!(store.apply_calls(), 1);
}

#[test(tokio::test)]
async fn test_workers_keep_per_path_order() {
    let store = Arc::new(MemoryGraphStore::new());
    let pipeline = Arc::new(pipeline_for(store.clone()));
    let queue = Arc::new(IngestQueue::new(16));
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let handle = pipeline.clone().spawn(queue.clone(), fatal_tx);

    // Same source timestamp throughout, so only arrival order decides the
    // final value.
    let policy = BackpressurePolicy::default();
    for idx in 0..50 {
        for path in ["site1/line1/temp", "site1/line2/temp", "site2/press"] {
            let msg = value_message(path, json!(idx), 1_000);
            queue.push(msg, policy).await;
        }
    }
    queue.close();
    assert!(handle.join(Duration::from_secs(5)).await);

    for path in ["site1/line1/temp", "site1/line2/temp", "site2/press"] {
        let node = store.node(path).await.unwrap().unwrap();
        assert_eq!(node.value, Some(json!(49)), "{path}");
    }
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.received, 150);
    assert_eq!(stats.applied, 150);
    assert!(stats.last_processed_at.is_some());
    assert!(store.tree_violations().await.unwrap().is_empty());
    assert!(fatal_rx.try_recv().is_err());
}

#[test(tokio::test)]
async fn test_fatal_error_stops_worker_and_is_reported() {
    let store = FlakyStore::new();
    let pipeline = Arc::new(pipeline_for(store.clone()));
    let queue = Arc::new(IngestQueue::new(4));
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let handle = pipeline.clone().spawn(queue.clone(), fatal_tx);

    store.fail_next(1, SyncError::Authentication("revoked".to_string()));
    queue
        .push(value_message("a/b", json!(1), 1), BackpressurePolicy::default())
        .await;

    let fatal = tokio::time::timeout(Duration::from_secs(2), fatal_rx.recv())
        .await
        .unwrap();
    assert!(matches!(fatal, Some(SyncError::Authentication(_))));

    queue.close();
    assert!(handle.join(Duration::from_secs(2)).await);
}

#[test(tokio::test)]
async fn test_pool_exhaustion_never_reaches_the_store() {
    let store = FlakyStore::new();
    let manager = Arc::new(StoreConnectionManager::new(
        store.clone(),
        fast_policy(),
        1,
        Duration::from_millis(5),
    ));
    manager.start().await.unwrap();

    let held = manager.sessions().acquire(Duration::from_millis(5)).await.unwrap();
    let set = crate::mutation::MutationBuilder::default().build(
        &crate::paths::PathParser::default().parse("a/b").unwrap(),
        None,
        1,
    );
    let res = manager.execute_transactional(&set).await;
    assert!(matches!(res, Err(SyncError::ConnectionLost { .. })));
    assert_eq!(store.apply_calls(), 0);
    drop(held);

    manager.execute_transactional(&set).await.unwrap();
    assert_eq!(manager.state().get(), ConnState::Connected);
}
