// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the mesh handles stalled, dead and failing parts
//! without panics, deadlocks or divergent state.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use circulation_mesh::config::{MeshConfig, PeerLinkConfig, ReplicaConfig};
use circulation_mesh::metrics::NoOpSink;
use circulation_mesh::model::{BookStatus, ReplicaRole};
use circulation_mesh::protocol::{Request, Response};
use circulation_mesh::replica::Replica;
use circulation_mesh::resilience::ResilientCall;
use circulation_mesh::store::{MemoryStore, ReplicaStore};
use circulation_mesh::transport::Endpoint;
use common::{book, catalog_books, catalog_lines, clock, replica_pair, start_mesh, test_config, ClosedEndpoint, StalledEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;

// =============================================================================
// Concurrency
// =============================================================================

/// Test: Many clients racing for one book get exactly one grant
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loans_grant_exactly_once() {
    let mut config = test_config();
    // Contention must not push anyone past the primary bound.
    config.actor.primary_timeout = "3s".to_string();
    let t = start_mesh(config).await;
    let client = t.mesh.client().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.call("LOAN 100".to_string()).await.unwrap() }));
    }

    let mut granted = 0;
    for task in tasks {
        let response = task.await.unwrap();
        if response.starts_with("GRANTED") {
            granted += 1;
        } else {
            assert_eq!(response, "DENIED already loaned");
        }
    }
    assert_eq!(granted, 1);

    let primary = t.mesh.replica(ReplicaRole::Primary).unwrap();
    assert_eq!(primary.pending_len().await, 1);
    assert!(primary.snapshot().await.is_consistent());
}

// =============================================================================
// Stalled and Dead Endpoints
// =============================================================================

/// Test: A primary that never answers costs exactly one timeout
#[tokio::test(start_paused = true)]
async fn stalled_primary_bounded_by_timeout() {
    let pair = replica_pair(false).await;
    let primary: Arc<dyn Endpoint<Request, Response>> = Arc::new(StalledEndpoint("primary"));
    let secondary: Arc<dyn Endpoint<Request, Response>> = pair.secondary.clone();
    let call: ResilientCall<Request, Response> =
        ResilientCall::new("loan_actor", primary, secondary, Duration::from_secs(3));

    let started = Instant::now();
    let answered = call.call(Request::loan(book("100"))).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(answered.served_by, ReplicaRole::Secondary);
    assert!(matches!(answered.response, Response::Granted { .. }));
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "{:?}", elapsed);
    assert_eq!(pair.secondary.pending_len().await, 1);
}

/// Test: A peer that never answers delays a commit by at most the notify bound
#[tokio::test(start_paused = true)]
async fn stalled_peer_does_not_block_commit() {
    let store: Arc<dyn ReplicaStore> = Arc::new(MemoryStore::new());
    let replica = Replica::open(
        ReplicaRole::Secondary,
        "secondary",
        store,
        clock(),
        Arc::new(NoOpSink),
        PeerLinkConfig::default(),
    )
    .await
    .unwrap();
    replica.seed(catalog_books()).await.unwrap();
    replica.link_peer(Arc::new(StalledEndpoint("primary/peer"))).unwrap();

    let started = Instant::now();
    let response = replica.loan_book(&book("100")).await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(response, Response::Granted { .. }));
    assert!(elapsed <= Duration::from_millis(1100), "{:?}", elapsed);
    // Not delivered, so it stays for the next pull.
    assert_eq!(replica.pending_len().await, 1);
}

/// Test: Reconcile against a dead peer fails and keeps the local log
#[tokio::test]
async fn reconcile_with_dead_peer_keeps_pending() {
    let store: Arc<dyn ReplicaStore> = Arc::new(MemoryStore::new());
    let replica = Replica::open(
        ReplicaRole::Primary,
        "primary",
        store,
        clock(),
        Arc::new(NoOpSink),
        PeerLinkConfig::default(),
    )
    .await
    .unwrap();
    replica.seed(catalog_books()).await.unwrap();
    replica.link_peer(Arc::new(ClosedEndpoint("secondary/peer"))).unwrap();

    replica.loan_book(&book("101")).await.unwrap();
    let err = replica.reconcile().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(replica.pending_len().await, 1);
}

// =============================================================================
// Persistence Failures
// =============================================================================

/// Test: A failed durable write leaves memory untouched and is not retried
#[tokio::test]
async fn failed_commit_surfaces_without_fallback() {
    let pair = replica_pair(true).await;
    pair.primary_store.set_fail_commits(true);

    let primary: Arc<dyn Endpoint<Request, Response>> = pair.primary.clone();
    let secondary: Arc<dyn Endpoint<Request, Response>> = pair.secondary.clone();
    let call: ResilientCall<Request, Response> =
        ResilientCall::new("loan_actor", primary, secondary, Duration::from_secs(1));

    let err = call.call(Request::loan(book("100"))).await.unwrap_err();
    assert_eq!(err.kind(), "persistence");
    assert!(pair.primary.active_loan(&book("100")).await.is_none());
    assert!(pair.secondary.active_loan(&book("100")).await.is_none());
    assert_eq!(pair.primary.pending_len().await, 0);

    pair.primary_store.set_fail_commits(false);
    let answered = call.call(Request::loan(book("100"))).await.unwrap();
    assert_eq!(answered.served_by, ReplicaRole::Primary);
    assert_eq!(pair.primary.pending_len().await, 1);
}

/// Test: A failed ack removal keeps the peer's log intact for a later retry
#[tokio::test]
async fn failed_ack_removal_retries_next_round() {
    let pair = replica_pair(false).await;
    pair.secondary.loan_book(&book("100")).await.unwrap();

    pair.secondary_store.set_fail_commits(true);
    assert!(pair.primary.reconcile().await.is_err());
    // Applied locally, still pending remotely.
    assert!(pair.primary.active_loan(&book("100")).await.is_some());
    assert_eq!(pair.secondary.pending_len().await, 1);

    pair.secondary_store.set_fail_commits(false);
    let report = pair.primary.reconcile().await.unwrap();
    assert_eq!(report.already_reflected, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(pair.secondary.pending_len().await, 0);
}

// =============================================================================
// Durable Restart
// =============================================================================

fn file_config(dir: &std::path::Path) -> MeshConfig {
    let mut config = MeshConfig::for_testing();
    config.catalog = catalog_lines();
    config.primary = ReplicaConfig {
        name: "primary".to_string(),
        sqlite_path: dir.join("primary.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    config.secondary = ReplicaConfig {
        name: "secondary".to_string(),
        sqlite_path: dir.join("secondary.db").to_string_lossy().into_owned(),
        wal_mode: true,
    };
    config
}

/// Test: Loans and unacknowledged changes survive a full restart
#[tokio::test]
async fn sqlite_state_survives_restart() {
    let dir = tempdir().unwrap();

    let mut first = start_mesh(file_config(dir.path())).await;
    first.mesh.stop_replica(ReplicaRole::Primary).unwrap();
    assert!(first.mesh.submit("LOAN 100").await.unwrap().starts_with("GRANTED"));
    first.mesh.shutdown().await;

    let second = start_mesh(file_config(dir.path())).await;
    let primary = second.mesh.replica(ReplicaRole::Primary).unwrap();
    let secondary = second.mesh.replica(ReplicaRole::Secondary).unwrap();

    // Reseeding does not touch existing rows.
    assert_eq!(primary.book(&book("100")).await.unwrap().status, BookStatus::Available);
    assert_eq!(secondary.book(&book("100")).await.unwrap().status, BookStatus::Loaned);
    assert_eq!(secondary.pending_len().await, 1);

    second.mesh.reconcile_now().await.unwrap();
    assert_eq!(primary.book(&book("100")).await.unwrap().status, BookStatus::Loaned);
    assert_eq!(secondary.pending_len().await, 0);
    assert_eq!(second.mesh.submit("LOAN 100").await.unwrap(), "DENIED already loaned");
}
