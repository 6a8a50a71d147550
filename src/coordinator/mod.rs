// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circulation mesh coordinator.
//!
//! Wires the processes of the mesh together and owns their lifecycle:
//! - two [`Replica`]s over their [`ReplicaStore`]s, linked to each other
//! - one listener per replica for client requests and one for peer messages
//! - the [`LoanActor`] listener and the [`ReturnRenewalActor`] subscriber
//! - the [`Dispatcher`] listener clients talk to
//! - the periodic reconcile loop
//!
//! ```text
//! client ─▶ dispatcher ─┬─▶ loan_actor ───────────┬─▶ primary   ◀─┐
//!                       │                         │               │ notify / pull / ack
//!                       └─▶ bus ─▶ return_actor ──┴─▶ secondary ◀─┘
//! ```
//!
//! Every arrow is an [`Endpoint`]; the two replica endpoints (client and peer
//! facing) sit behind a shared [`LinkSwitch`] so a replica can be made
//! unreachable and brought back without restarting the mesh.

mod reconcile;
mod types;

pub use types::{MeshHealth, MeshState, ReplicaHealth};

use crate::actor::{Completion, LoanActor, ReturnRenewalActor};
use crate::bus::{Topic, TopicBus};
use crate::config::MeshConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{MeshError, Result};
use crate::metrics::{self, MetricsSink, RecorderSink};
use crate::model::{Clock, ReplicaRole, SystemClock};
use crate::protocol::{PeerMessage, PeerReply, Request, Response};
use crate::replica::{ReconcileReport, Replica};
use crate::resilience::ResilientCall;
use crate::store::{ReplicaStore, SqliteStore};
use crate::transport::{self, ChannelEndpoint, Endpoint, LinkSwitch, Switched};
use reconcile::Member;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each task to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything that exists only while the mesh is running.
struct Running {
    /// Primary first, secondary second.
    members: [Member; 2],
    dispatcher: Arc<Dispatcher>,
    client: ChannelEndpoint<String, String>,
    return_actor: Arc<ReturnRenewalActor>,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    fn member(&self, role: ReplicaRole) -> &Member {
        match role {
            ReplicaRole::Primary => &self.members[0],
            ReplicaRole::Secondary => &self.members[1],
        }
    }
}

/// The circulation mesh.
///
/// # Example
///
/// ```rust,ignore
/// let mut config = MeshConfig::for_testing();
/// config.catalog.push("100, Dune, Frank Herbert".into());
///
/// let mut mesh = Mesh::new(config);
/// mesh.start().await?;
/// assert!(mesh.submit("LOAN 100").await?.starts_with("GRANTED"));
/// mesh.shutdown().await;
/// ```
pub struct Mesh {
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,

    /// Mesh state (broadcast to watchers)
    state_tx: watch::Sender<MeshState>,
    state_rx: watch::Receiver<MeshState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    running: Option<Running>,
}

impl Mesh {
    /// Create a mesh on the system clock, reporting to the `metrics` facade.
    ///
    /// The mesh starts in `Created` state. Call [`start()`](Self::start) to
    /// open the stores and spawn its processes.
    pub fn new(config: MeshConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(MeshState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(RecorderSink),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            running: None,
        }
    }

    /// Replace the clock loan dates are computed from.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the sink every component records samples into.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn state(&self) -> MeshState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<MeshState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), MeshState::Running)
    }

    fn set_state(&self, state: MeshState) {
        let _ = self.state_tx.send(state);
        metrics::set_mesh_state(state.as_str());
    }

    /// Start the mesh.
    ///
    /// 1. Validates the configuration and parses the catalog
    /// 2. Opens both stores and loads the replicas
    /// 3. Seeds catalog books that are absent
    /// 4. Links the replicas and spawns every listener and background task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != MeshState::Created {
            return Err(MeshError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            primary = %self.config.primary.name,
            secondary = %self.config.secondary.name,
            catalog = self.config.catalog.len(),
            "Starting circulation mesh"
        );
        self.set_state(MeshState::Starting);

        match self.bootstrap().await {
            Ok(running) => {
                self.running = Some(running);
                self.set_state(MeshState::Running);
                info!("Circulation mesh running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Circulation mesh failed to start");
                self.set_state(MeshState::Failed);
                Err(e)
            }
        }
    }

    async fn open_replica(&self, role: ReplicaRole) -> Result<Arc<Replica>> {
        let replica_config = self.config.replica(role);
        let store: Arc<dyn ReplicaStore> =
            Arc::new(SqliteStore::open(&replica_config.sqlite_path, replica_config.wal_mode).await?);
        let replica = Replica::open(
            role,
            replica_config.name.clone(),
            store,
            Arc::clone(&self.clock),
            Arc::clone(&self.metrics),
            self.config.peer.clone(),
        )
        .await?;
        Ok(Arc::new(replica))
    }

    async fn bootstrap(&self) -> Result<Running> {
        self.config.validate()?;
        let books = self.config.seed_books()?;
        let capacity = self.config.channels.request_capacity;

        let primary = self.open_replica(ReplicaRole::Primary).await?;
        let secondary = self.open_replica(ReplicaRole::Secondary).await?;
        for replica in [&primary, &secondary] {
            let inserted = replica.seed(books.clone()).await?;
            info!(replica = %replica.name(), inserted, "Catalog seeded");
        }

        let mut handles = Vec::new();

        // Replica listeners: one inbox for clients, one for the peer.
        let mut client_links: Vec<Arc<dyn Endpoint<Request, Response>>> = Vec::with_capacity(2);
        let mut peer_links: Vec<Arc<dyn Endpoint<PeerMessage, PeerReply>>> = Vec::with_capacity(2);
        let mut members = Vec::with_capacity(2);
        for replica in [&primary, &secondary] {
            let switch = LinkSwitch::default();

            let (client, inbox) = transport::channel::<Request, Response>(replica.name(), capacity);
            handles.push(transport::serve(inbox, Arc::clone(replica), self.shutdown_rx.clone()));
            client_links.push(Arc::new(Switched::new(client, switch.clone())));

            let (peer, inbox) = transport::channel::<PeerMessage, PeerReply>(format!("{}/peer", replica.name()), capacity);
            handles.push(transport::serve(inbox, Arc::clone(replica), self.shutdown_rx.clone()));
            peer_links.push(Arc::new(Switched::new(peer, switch.clone())));

            members.push(Member {
                replica: Arc::clone(replica),
                switch,
            });
        }
        primary.link_peer(Arc::clone(&peer_links[1]))?;
        secondary.link_peer(Arc::clone(&peer_links[0]))?;
        debug!("Replicas linked");

        let primary_timeout = self.config.actor.primary_timeout_duration();
        let fallback = |component: &str| {
            ResilientCall::new(
                component,
                Arc::clone(&client_links[0]),
                Arc::clone(&client_links[1]),
                primary_timeout,
            )
        };

        // Loan actor behind its own listener.
        let loan_actor = Arc::new(LoanActor::new(fallback(LoanActor::COMPONENT), Arc::clone(&self.metrics)));
        let (loan_endpoint, inbox) = transport::channel::<Request, Response>(LoanActor::COMPONENT, capacity);
        handles.push(transport::serve(inbox, loan_actor, self.shutdown_rx.clone()));

        // Subscribe before the dispatcher can publish.
        let bus = TopicBus::new(
            self.config.channels.bus_capacity,
            self.config.channels.publish_timeout_duration(),
        );
        let subscription = bus.subscribe(ReturnRenewalActor::COMPONENT, &[Topic::Return, Topic::Renewal]);
        let return_actor = Arc::new(ReturnRenewalActor::new(
            fallback(ReturnRenewalActor::COMPONENT),
            Arc::clone(&self.metrics),
        ));
        let actor = Arc::clone(&return_actor);
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = actor.run(subscription, shutdown_rx).await {
                warn!(error = %e, "Return/renewal actor exited with error");
            }
        }));

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(loan_endpoint), bus, Arc::clone(&self.metrics)));
        let (client, inbox) = transport::channel::<String, String>(Dispatcher::COMPONENT, capacity);
        handles.push(transport::serve(inbox, Arc::clone(&dispatcher), self.shutdown_rx.clone()));

        if self.config.reconcile.enabled {
            let members = members.clone();
            let config = self.config.reconcile.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(reconcile::run_reconcile_loop(members, config, shutdown_rx)));
            info!("Spawned periodic reconciliation");
        }

        let members: [Member; 2] = members
            .try_into()
            .map_err(|_| MeshError::Internal("expected exactly two replicas".to_string()))?;

        info!(tasks = handles.len(), "Spawned mesh tasks");
        Ok(Running {
            members,
            dispatcher,
            client,
            return_actor,
            handles,
        })
    }

    fn running(&self) -> Result<&Running> {
        if matches!(self.state(), MeshState::ShuttingDown | MeshState::Stopped) {
            return Err(MeshError::Shutdown);
        }
        self.running.as_ref().filter(|_| self.is_running()).ok_or_else(|| MeshError::InvalidState {
            expected: "Running".to_string(),
            actual: self.state().to_string(),
        })
    }

    /// The dispatcher, for in-process callers that skip the client channel.
    pub fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        Ok(Arc::clone(&self.running()?.dispatcher))
    }

    /// A client endpoint on the dispatcher's listener.
    pub fn client(&self) -> Result<ChannelEndpoint<String, String>> {
        Ok(self.running()?.client.clone())
    }

    /// Send one raw request line through the client channel.
    pub async fn submit(&self, raw: &str) -> Result<String> {
        let client = self.client()?;
        client.call(raw.to_string()).await
    }

    pub fn replica(&self, role: ReplicaRole) -> Result<Arc<Replica>> {
        Ok(Arc::clone(&self.running()?.member(role).replica))
    }

    /// Outcomes of `RETURN`/`RENEW` requests processed after this call.
    pub fn completions(&self) -> Result<broadcast::Receiver<Completion>> {
        Ok(self.running()?.return_actor.completions())
    }

    /// Make a replica unreachable: both of its endpoints fail with a
    /// transport error and the reconcile loop skips it. State is kept.
    pub fn stop_replica(&self, role: ReplicaRole) -> Result<()> {
        let member = self.running()?.member(role);
        member.switch.sever();
        warn!(replica = %member.replica.name(), "Replica stopped");
        Ok(())
    }

    /// Undo [`stop_replica`](Self::stop_replica).
    ///
    /// Whatever the peer did meanwhile reaches this replica on the next
    /// reconcile round.
    pub fn resume_replica(&self, role: ReplicaRole) -> Result<()> {
        let member = self.running()?.member(role);
        member.switch.restore();
        info!(replica = %member.replica.name(), "Replica resumed");
        Ok(())
    }

    /// Run one reconcile round on each reachable replica, primary first.
    pub async fn reconcile_now(&self) -> Result<Vec<(String, ReconcileReport)>> {
        let running = self.running()?;
        Ok(reconcile::run_round(&running.members).await)
    }

    /// Health of the mesh and both replicas.
    ///
    /// **Performance**: reads local replica state only.
    pub async fn health_check(&self) -> MeshHealth {
        let state = self.state();
        let mut replicas = Vec::with_capacity(2);
        if let Some(running) = &self.running {
            for member in &running.members {
                let snapshot = member.replica.snapshot().await;
                replicas.push(ReplicaHealth {
                    role: member.replica.role(),
                    name: member.replica.name().to_string(),
                    reachable: !member.switch.is_down(),
                    linked: member.replica.is_linked(),
                    books: snapshot.books.len(),
                    active_loans: snapshot.loans.len(),
                    pending: snapshot.pending.len(),
                });
            }
        }

        let running = state == MeshState::Running;
        let reachable = replicas.iter().filter(|r| r.reachable).count();
        MeshHealth {
            state,
            ready: running && reachable > 0,
            healthy: running && reachable == replicas.len(),
            replicas,
        }
    }

    /// Shut the mesh down gracefully.
    ///
    /// 1. Signal every listener and background task to stop
    /// 2. Wait for them (bounded per task)
    /// 3. Close both stores
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), MeshState::Stopped | MeshState::ShuttingDown) {
            return;
        }
        info!("Shutting down circulation mesh");
        self.set_state(MeshState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        if let Some(running) = self.running.take() {
            let task_count = running.handles.len();
            debug!(task_count, "Waiting for mesh tasks");
            for (i, handle) in running.handles.into_iter().enumerate() {
                match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                    Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                    Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                    Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
                }
            }

            for member in &running.members {
                if let Err(e) = member.replica.close().await {
                    warn!(replica = %member.replica.name(), error = %e, "Failed to close replica store");
                }
            }
        }

        self.set_state(MeshState::Stopped);
        info!("Circulation mesh stopped");
    }
}
