// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage replica.
//!
//! Primary and secondary are two instances of [`Replica`] that differ only in
//! their [`ReplicaRole`]. Each owns:
//!
//! - the catalog (book id → [`Book`])
//! - the loan table (book id → [`Loan`])
//! - the book versions (book id → [`Version`])
//! - the pending-change log ([`PendingChange`]s not yet acknowledged by the peer)
//!
//! # Commit Ordering
//!
//! ```text
//! lock state ─▶ decide ─▶ store.commit(book, loan, pending) ─▶ update memory ─▶ unlock
//!                                   │ Err                                         │
//!                                   ▼                                             ▼
//!                         memory untouched,                            notify peer (≤ notify_timeout)
//!                         ERROR persistence ...
//! ```
//!
//! The state mutex is held across the durable commit, so a mutation and its
//! pending entry become visible together. It is released before any peer call:
//! a replica never waits on its peer while holding its own lock.
//!
//! Peer-facing operations (apply, pull, ack, requester-side reconcile) live in
//! [`reconcile`].

pub mod reconcile;

pub use reconcile::ReconcileReport;

use crate::config::PeerLinkConfig;
use crate::error::{BoxFuture, MeshError, Result};
use crate::metrics::{self, MetricsSink, Stopwatch};
use crate::model::{Book, BookId, BookStatus, ChangeKind, Clock, Loan, PendingChange, ReplicaRole, Version};
use crate::protocol::{Denial, Operation, PeerMessage, PeerReply, Request, Response};
use crate::store::{Commit, ReplicaStore, Seed, Snapshot};
use crate::transport::Endpoint;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Link to the other replica's peer-facing endpoint.
pub type PeerLink = Arc<dyn Endpoint<PeerMessage, PeerReply>>;

/// In-memory circulation state guarded by the replica mutex.
#[derive(Debug, Default)]
pub(crate) struct ReplicaState {
    pub(crate) catalog: BTreeMap<BookId, Book>,
    pub(crate) loans: BTreeMap<BookId, Loan>,
    pub(crate) versions: BTreeMap<BookId, Version>,
    pub(crate) pending: Vec<PendingChange>,
    pub(crate) next_sequence: u64,
}

impl ReplicaState {
    fn from_snapshot(role: ReplicaRole, snapshot: Snapshot) -> Self {
        let next_sequence = snapshot
            .pending
            .iter()
            .filter(|c| c.origin == role)
            .map(|c| c.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            catalog: snapshot.books.into_iter().map(|b| (b.id.clone(), b)).collect(),
            loans: snapshot.loans.into_iter().map(|l| (l.book_id.clone(), l)).collect(),
            versions: snapshot.versions,
            pending: snapshot.pending,
            next_sequence,
        }
    }

    pub(crate) fn version_of(&self, book_id: &BookId) -> Version {
        self.versions.get(book_id).copied().unwrap_or_default()
    }

    /// Set a book's loan to `loan`, its status to match, and its version.
    pub(crate) fn set_loan(&mut self, book_id: &BookId, loan: Option<Loan>, version: Version) {
        self.versions.insert(book_id.clone(), version);
        let status = match loan {
            Some(loan) => {
                self.loans.insert(book_id.clone(), loan);
                BookStatus::Loaned
            }
            None => {
                self.loans.remove(book_id);
                BookStatus::Available
            }
        };
        if let Some(book) = self.catalog.get_mut(book_id) {
            book.status = status;
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            books: self.catalog.values().cloned().collect(),
            loans: self.loans.values().cloned().collect(),
            versions: self.versions.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// What a client operation decided before anything is written.
enum Decision {
    /// Answer without mutating.
    Reply(Response),
    /// Commit `loan` as the book's new post-image, log `kind`, answer `response`.
    Mutate {
        kind: ChangeKind,
        loan: Option<Loan>,
        response: Response,
    },
}

/// One storage replica.
pub struct Replica {
    role: ReplicaRole,
    name: String,
    store: Arc<dyn ReplicaStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    peer_config: PeerLinkConfig,
    peer: OnceLock<PeerLink>,
    state: Mutex<ReplicaState>,
}

impl Replica {
    /// Load persisted state from `store`.
    pub async fn open(
        role: ReplicaRole,
        name: impl Into<String>,
        store: Arc<dyn ReplicaStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        peer_config: PeerLinkConfig,
    ) -> Result<Self> {
        let name = name.into();
        let snapshot = store.load().await?;
        let state = ReplicaState::from_snapshot(role, snapshot);
        info!(
            replica = %name,
            role = %role,
            books = state.catalog.len(),
            loans = state.loans.len(),
            pending = state.pending.len(),
            "Replica loaded"
        );
        metrics::set_pending_depth(&name, state.pending.len());
        Ok(Self {
            role,
            name,
            store,
            clock,
            metrics,
            peer_config,
            peer: OnceLock::new(),
            state: Mutex::new(state),
        })
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the peer's endpoint. Can be set once.
    pub fn link_peer(&self, peer: PeerLink) -> Result<()> {
        self.peer.set(peer).map_err(|_| MeshError::InvalidState {
            expected: "unlinked replica".to_string(),
            actual: format!("{} already linked", self.name),
        })
    }

    pub fn is_linked(&self) -> bool {
        self.peer.get().is_some()
    }

    /// Insert catalog books that are absent. `LOANED` seeds get a loan dated today.
    ///
    /// Seeding does not log pending changes.
    pub async fn seed(&self, books: Vec<Book>) -> Result<usize> {
        if books.is_empty() {
            return Ok(0);
        }
        let today = self.clock.today();
        let seeds = books
            .into_iter()
            .map(|book| {
                let loan = (book.status == BookStatus::Loaned).then(|| Loan::new(book.id.clone(), today));
                Seed { book, loan }
            })
            .collect();

        let mut state = self.state.lock().await;
        let inserted = self.store.seed(seeds).await?;
        if inserted > 0 {
            let snapshot = self.store.load().await?;
            let fresh = ReplicaState::from_snapshot(self.role, snapshot);
            state.catalog = fresh.catalog;
            state.loans = fresh.loans;
            state.versions = fresh.versions;
            debug!(replica = %self.name, inserted, "Catalog seeded");
        }
        Ok(inserted)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client-facing operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle a typed client request, recording one metrics sample.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let watch = Stopwatch::start(self.component(), request.operation.as_str());
        let result = match request.operation {
            Operation::Loan => self.loan_book(&request.book_id).await,
            Operation::Return => self.return_book(&request.book_id).await,
            Operation::Renew => self.renew_book(&request.book_id).await,
            Operation::Availability => Ok(self.availability(&request.book_id).await),
        };
        let sample = match &result {
            Ok(response) => watch.finish(response.is_success(), format!("{} -> {}", request, response)),
            Err(e) => watch.finish(false, format!("{} -> {}", request, e)),
        };
        self.metrics.record(sample);
        result
    }

    /// Grant a loan on an available book.
    pub async fn loan_book(&self, book_id: &BookId) -> Result<Response> {
        self.mutate(book_id, |state, today| {
            Ok(match state.catalog.get(book_id).map(|b| b.status) {
                None => Decision::Reply(Response::NotFound),
                Some(BookStatus::Loaned) => Decision::Reply(Response::Denied(Denial::AlreadyLoaned)),
                Some(BookStatus::Available) => {
                    let loan = Loan::new(book_id.clone(), today);
                    Decision::Mutate {
                        kind: ChangeKind::Loan,
                        response: Response::Granted { due_date: loan.due_date },
                        loan: Some(loan),
                    }
                }
            })
        })
        .await
    }

    /// Return a loaned book.
    pub async fn return_book(&self, book_id: &BookId) -> Result<Response> {
        self.mutate(book_id, |state, _today| {
            Ok(match state.catalog.get(book_id).map(|b| b.status) {
                None => Decision::Reply(Response::NotFound),
                Some(BookStatus::Available) => Decision::Reply(Response::Denied(Denial::NotLoaned)),
                Some(BookStatus::Loaned) => Decision::Mutate {
                    kind: ChangeKind::Return,
                    loan: None,
                    response: Response::Returned,
                },
            })
        })
        .await
    }

    /// Renew a loan once; an available book is loaned instead.
    pub async fn renew_book(&self, book_id: &BookId) -> Result<Response> {
        self.mutate(book_id, |state, today| match state.catalog.get(book_id).map(|b| b.status) {
            None => Ok(Decision::Reply(Response::NotFound)),
            Some(BookStatus::Available) => {
                let loan = Loan::new(book_id.clone(), today);
                Ok(Decision::Mutate {
                    kind: ChangeKind::Renewal,
                    response: Response::RenewedAsNewLoan { due_date: loan.due_date },
                    loan: Some(loan),
                })
            }
            Some(BookStatus::Loaned) => {
                let current = state.loans.get(book_id).ok_or_else(|| {
                    MeshError::Internal(format!("book {} is LOANED without a loan record", book_id))
                })?;
                Ok(match current.renewed(today) {
                    Some(loan) => Decision::Mutate {
                        kind: ChangeKind::Renewal,
                        response: Response::Renewed { due_date: loan.due_date },
                        loan: Some(loan),
                    },
                    None => Decision::Reply(Response::Denied(Denial::RenewalCapReached)),
                })
            }
        })
        .await
    }

    /// Read-only status check.
    pub async fn availability(&self, book_id: &BookId) -> Response {
        let state = self.state.lock().await;
        match state.catalog.get(book_id) {
            Some(book) => Response::Status { status: book.status },
            None => Response::NotFound,
        }
    }

    async fn mutate<F>(&self, book_id: &BookId, decide: F) -> Result<Response>
    where
        F: FnOnce(&ReplicaState, NaiveDate) -> Result<Decision>,
    {
        let (change, response) = {
            let mut state = self.state.lock().await;
            let (kind, loan, response) = match decide(&*state, self.clock.today())? {
                Decision::Reply(response) => return Ok(response),
                Decision::Mutate { kind, loan, response } => (kind, loan, response),
            };

            let version = state.version_of(book_id).next(self.role);
            let change = PendingChange {
                origin: self.role,
                sequence: state.next_sequence,
                timestamp_ms: self.clock.now().timestamp_millis(),
                kind,
                book_id: book_id.clone(),
                version: version.counter,
                loan: loan.clone(),
            };
            let commit = Commit {
                book_id: book_id.clone(),
                loan: loan.clone(),
                version,
                pending: Some(change.clone()),
            };
            if let Err(e) = self.store.commit(commit).await {
                warn!(replica = %self.name, book_id = %book_id, operation = %kind, error = %e, "Durable commit failed");
                return Err(e);
            }

            state.set_loan(book_id, loan, version);
            state.pending.push(change.clone());
            state.next_sequence += 1;
            metrics::set_pending_depth(&self.name, state.pending.len());
            debug!(replica = %self.name, book_id = %book_id, operation = %kind, change = %change, "Committed");
            (change, response)
        };

        self.notify_peer(change).await;
        Ok(response)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy of the current in-memory state.
    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn pending(&self) -> Vec<PendingChange> {
        self.state.lock().await.pending.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn book(&self, book_id: &BookId) -> Option<Book> {
        self.state.lock().await.catalog.get(book_id).cloned()
    }

    pub async fn active_loan(&self, book_id: &BookId) -> Option<Loan> {
        self.state.lock().await.loans.get(book_id).cloned()
    }

    /// Current version of a book, `None` when it is not in the catalog.
    pub async fn version(&self, book_id: &BookId) -> Option<Version> {
        let state = self.state.lock().await;
        state.catalog.contains_key(book_id).then(|| state.version_of(book_id))
    }

    /// Release the backing store.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    fn component(&self) -> String {
        format!("replica.{}", self.name)
    }
}

impl Endpoint<Request, Response> for Replica {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(self.handle(request))
    }
}

impl Endpoint<PeerMessage, PeerReply> for Replica {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, message: PeerMessage) -> BoxFuture<'_, PeerReply> {
        Box::pin(self.handle_peer(message))
    }
}
