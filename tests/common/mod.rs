// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - a fixed clock and a small seed catalog
//! - mesh and replica-pair fixtures on in-memory stores
//! - endpoints that never answer or are already gone

#![allow(dead_code)]

use chrono::NaiveDate;
use circulation_mesh::actor::Completion;
use circulation_mesh::config::{MeshConfig, PeerLinkConfig};
use circulation_mesh::error::{BoxFuture, MeshError};
use circulation_mesh::metrics::MemorySink;
use circulation_mesh::model::{Book, BookId, FixedClock, ReplicaRole};
use circulation_mesh::replica::Replica;
use circulation_mesh::store::{MemoryStore, ReplicaStore};
use circulation_mesh::transport::Endpoint;
use circulation_mesh::Mesh;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// The date every fixture clock starts at.
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 1).unwrap()
}

pub fn days_after_today(days: i64) -> NaiveDate {
    today() + chrono::Duration::days(days)
}

pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::at_date(today()))
}

pub fn book(id: &str) -> BookId {
    BookId::parse(id).unwrap()
}

pub fn catalog_lines() -> Vec<String> {
    vec![
        "100, Dune, Frank Herbert".to_string(),
        "101, Emma, Jane Austen".to_string(),
        "102, Ulysses, James Joyce, LOANED".to_string(),
    ]
}

pub fn catalog_books() -> Vec<Book> {
    catalog_lines()
        .iter()
        .map(|line| Book::parse_seed_line(line).unwrap())
        .collect()
}

pub fn test_config() -> MeshConfig {
    let mut config = MeshConfig::for_testing();
    config.catalog = catalog_lines();
    config
}

/// A started mesh with handles on its clock and metrics.
pub struct TestMesh {
    pub mesh: Mesh,
    pub clock: Arc<FixedClock>,
    pub sink: Arc<MemorySink>,
}

pub async fn start_mesh(config: MeshConfig) -> TestMesh {
    let clock = clock();
    let sink = Arc::new(MemorySink::new());
    let mut mesh = Mesh::new(config).with_clock(clock.clone()).with_metrics(sink.clone());
    mesh.start().await.expect("mesh should start");
    TestMesh { mesh, clock, sink }
}

/// Wait for the next out-of-band completion.
pub async fn next_completion(rx: &mut broadcast::Receiver<Completion>) -> Completion {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion within 5s")
        .expect("completion channel open")
}

/// Two replicas over in-memory stores, linked directly to each other.
pub struct ReplicaPair {
    pub primary: Arc<Replica>,
    pub secondary: Arc<Replica>,
    pub primary_store: Arc<MemoryStore>,
    pub secondary_store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
}

pub async fn replica_pair(notify_enabled: bool) -> ReplicaPair {
    let clock = clock();
    let peer_config = PeerLinkConfig {
        notify_enabled,
        ..PeerLinkConfig::default()
    };
    let primary_store = Arc::new(MemoryStore::new());
    let secondary_store = Arc::new(MemoryStore::new());

    let open = |role: ReplicaRole, store: Arc<MemoryStore>| {
        let clock = clock.clone();
        let peer_config = peer_config.clone();
        async move {
            let store: Arc<dyn ReplicaStore> = store;
            let replica = Replica::open(role, role.as_str(), store, clock, Arc::new(MemorySink::new()), peer_config)
                .await
                .unwrap();
            replica.seed(catalog_books()).await.unwrap();
            Arc::new(replica)
        }
    };
    let primary = open(ReplicaRole::Primary, primary_store.clone()).await;
    let secondary = open(ReplicaRole::Secondary, secondary_store.clone()).await;
    primary.link_peer(secondary.clone()).unwrap();
    secondary.link_peer(primary.clone()).unwrap();

    ReplicaPair {
        primary,
        secondary,
        primary_store,
        secondary_store,
        clock,
    }
}

/// Accepts every request and never answers.
pub struct StalledEndpoint(pub &'static str);

impl<Req: Send + 'static, Rep: Send + 'static> Endpoint<Req, Rep> for StalledEndpoint {
    fn name(&self) -> &str {
        self.0
    }

    fn call(&self, _request: Req) -> BoxFuture<'_, Rep> {
        Box::pin(async {
            std::future::pending::<()>().await;
            Err(MeshError::Internal("stalled endpoint resumed".to_string()))
        })
    }
}

/// An endpoint whose process is gone.
pub struct ClosedEndpoint(pub &'static str);

impl<Req: Send + 'static, Rep: Send + 'static> Endpoint<Req, Rep> for ClosedEndpoint {
    fn name(&self) -> &str {
        self.0
    }

    fn call(&self, _request: Req) -> BoxFuture<'_, Rep> {
        let name = self.0;
        Box::pin(async move { Err(MeshError::transport(name, "endpoint closed")) })
    }
}
