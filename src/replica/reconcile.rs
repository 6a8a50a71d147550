// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica-to-replica reconciliation.
//!
//! # Protocol
//!
//! ```text
//! requester                              responder
//!     │──── PULL_CHANGES ──────────────────▶│
//!     │◀─── Changes([c1, c2, ...]) ─────────│   or NoChanges when the log is empty
//!     │  apply each (skip if reflected)     │
//!     │──── ACK_CHANGES([c1, c2]) ─────────▶│   only settled entries
//!     │◀─── Acked { removed } ──────────────│   exact matches dropped, durably first
//! ```
//!
//! Push notifications ride the same link: after every local commit the
//! replica sends `NOTIFY(change)` and the peer applies it. A notification is
//! never an acknowledgment; the entry stays in the sender's log until a pull
//! round acks it.
//!
//! Applying a remote change sets the book to the change's post-image when the
//! change's [`Version`] is newer than the book's; an older change is dropped
//! as superseded and still acknowledged. Each book therefore ends on the
//! write with the highest version on both sides, whatever order the logs are
//! exchanged in. Applying does not append to the local pending log and does
//! not notify back, so changes never ping-pong between replicas.
//!
//! [`Version`]: crate::model::Version

use super::{PeerLink, Replica};
use crate::error::{MeshError, Result};
use crate::metrics;
use crate::model::PendingChange;
use crate::protocol::{ApplyOutcome, PeerMessage, PeerReply};
use crate::store::Commit;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of one pull/ack round run as requester.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries received from the peer.
    pub pulled: usize,
    pub applied: usize,
    pub already_reflected: usize,
    /// Entries older than the local write for the same book (acknowledged, not applied).
    pub superseded: usize,
    /// Entries for books missing from the local catalog (left unacknowledged).
    pub unknown: usize,
    /// Entries whose local apply failed (left unacknowledged).
    pub failed: usize,
    /// Entries the peer removed from its log.
    pub acked: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.pulled == 0
    }
}

impl Replica {
    /// Serve one peer message.
    pub async fn handle_peer(&self, message: PeerMessage) -> Result<PeerReply> {
        debug!(replica = %self.name, message = message.label(), "Peer message");
        match message {
            PeerMessage::Notify(change) => Ok(PeerReply::Notified(self.apply_remote(&change).await?)),
            PeerMessage::PullChanges => Ok(self.pull_changes().await),
            PeerMessage::AckChanges(entries) => Ok(PeerReply::Acked {
                removed: self.ack_changes(entries).await?,
            }),
        }
    }

    /// Apply a change that originated on the peer. Idempotent.
    ///
    /// Only a change newer than the book's current version is written.
    pub async fn apply_remote(&self, change: &PendingChange) -> Result<ApplyOutcome> {
        let mut state = self.state.lock().await;

        if !state.catalog.contains_key(&change.book_id) {
            warn!(replica = %self.name, change = %change, "Remote change for unknown book");
            return Ok(ApplyOutcome::UnknownBook);
        }
        let local = state.version_of(&change.book_id);
        let remote = change.book_version();
        if remote < local {
            debug!(replica = %self.name, change = %change, local = %local, "Remote change superseded");
            return Ok(ApplyOutcome::Superseded);
        }
        if remote == local {
            return Ok(ApplyOutcome::AlreadyReflected);
        }

        // Newer, possibly with the same loan: the version still moves.
        let reflected = state.loans.get(&change.book_id) == change.loan.as_ref();
        self.store
            .commit(Commit {
                book_id: change.book_id.clone(),
                loan: change.loan.clone(),
                version: remote,
                pending: None,
            })
            .await?;
        state.set_loan(&change.book_id, change.loan.clone(), remote);
        if reflected {
            return Ok(ApplyOutcome::AlreadyReflected);
        }
        debug!(replica = %self.name, change = %change, "Applied remote change");
        Ok(ApplyOutcome::Applied)
    }

    /// The local pending log in append order, or `NoChanges`.
    pub async fn pull_changes(&self) -> PeerReply {
        let state = self.state.lock().await;
        if state.pending.is_empty() {
            PeerReply::NoChanges
        } else {
            PeerReply::Changes(state.pending.clone())
        }
    }

    /// Drop exact matches of `entries` from the pending log. Returns how many were removed.
    pub async fn ack_changes(&self, entries: Vec<PendingChange>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let matched: Vec<PendingChange> = entries
            .into_iter()
            .filter(|entry| state.pending.contains(entry))
            .collect();
        if matched.is_empty() {
            return Ok(0);
        }

        let removed = self.store.remove_pending(matched.clone()).await?;
        state.pending.retain(|entry| !matched.contains(entry));
        metrics::set_pending_depth(&self.name, state.pending.len());
        info!(replica = %self.name, removed, remaining = state.pending.len(), "Pending changes acknowledged");
        Ok(removed)
    }

    /// Pull the peer's pending log, apply it, and acknowledge what was settled.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let result = self.reconcile_round().await;
        match &result {
            Ok(report) => {
                metrics::record_reconcile_round(&self.name, report.applied, report.acked, true, started.elapsed());
                if !report.is_noop() {
                    info!(
                        replica = %self.name,
                        pulled = report.pulled,
                        applied = report.applied,
                        already_reflected = report.already_reflected,
                        superseded = report.superseded,
                        unknown = report.unknown,
                        failed = report.failed,
                        acked = report.acked,
                        "Reconcile round complete"
                    );
                }
            }
            Err(e) => {
                metrics::record_reconcile_round(&self.name, 0, 0, false, started.elapsed());
                warn!(replica = %self.name, error = %e, "Reconcile round failed");
            }
        }
        result
    }

    async fn reconcile_round(&self) -> Result<ReconcileReport> {
        let peer = self.peer_link()?;
        let mut report = ReconcileReport::default();

        let changes = match self.call_peer(&peer, PeerMessage::PullChanges).await? {
            PeerReply::NoChanges => return Ok(report),
            PeerReply::Changes(changes) => changes,
            other => {
                return Err(MeshError::Internal(format!(
                    "unexpected reply to PULL_CHANGES: {:?}",
                    other
                )))
            }
        };
        report.pulled = changes.len();

        let mut settled = Vec::with_capacity(changes.len());
        for change in changes {
            match self.apply_remote(&change).await {
                Ok(ApplyOutcome::Applied) => {
                    report.applied += 1;
                    settled.push(change);
                }
                Ok(ApplyOutcome::AlreadyReflected) => {
                    report.already_reflected += 1;
                    settled.push(change);
                }
                Ok(ApplyOutcome::Superseded) => {
                    report.superseded += 1;
                    settled.push(change);
                }
                Ok(ApplyOutcome::UnknownBook) => report.unknown += 1,
                Err(e) => {
                    warn!(replica = %self.name, change = %change, error = %e, "Failed to apply pulled change");
                    report.failed += 1;
                }
            }
        }

        if settled.is_empty() {
            return Ok(report);
        }
        match self.call_peer(&peer, PeerMessage::AckChanges(settled)).await? {
            PeerReply::Acked { removed } => report.acked = removed,
            other => {
                return Err(MeshError::Internal(format!(
                    "unexpected reply to ACK_CHANGES: {:?}",
                    other
                )))
            }
        }
        Ok(report)
    }

    /// Best-effort push of a freshly committed change. Never fails the caller.
    pub(crate) async fn notify_peer(&self, change: PendingChange) {
        if !self.peer_config.notify_enabled {
            return;
        }
        let Some(peer) = self.peer.get() else {
            return;
        };
        let bound = self.peer_config.notify_timeout_duration();
        let outcome = match timeout(bound, peer.call(PeerMessage::Notify(change))).await {
            Ok(Ok(PeerReply::Notified(ApplyOutcome::Superseded))) => "superseded",
            Ok(Ok(PeerReply::Notified(outcome))) if outcome.is_settled() => "delivered",
            Ok(Ok(PeerReply::Notified(_))) => "unknown_book",
            Ok(Ok(other)) => {
                warn!(replica = %self.name, reply = ?other, "Unexpected reply to NOTIFY");
                "unexpected"
            }
            Ok(Err(e)) => {
                debug!(replica = %self.name, peer = %peer.name(), error = %e, "Peer notify failed");
                "failed"
            }
            Err(_) => {
                debug!(replica = %self.name, peer = %peer.name(), after = ?bound, "Peer notify timed out");
                "timeout"
            }
        };
        metrics::record_notify(&self.name, outcome);
    }

    fn peer_link(&self) -> Result<PeerLink> {
        self.peer
            .get()
            .cloned()
            .ok_or_else(|| MeshError::Config(format!("replica {} has no peer link", self.name)))
    }

    async fn call_peer(&self, peer: &PeerLink, message: PeerMessage) -> Result<PeerReply> {
        let bound = self.peer_config.sync_timeout_duration();
        let label = message.label();
        match timeout(bound, peer.call(message)).await {
            Ok(reply) => reply,
            Err(_) => {
                debug!(replica = %self.name, message = label, "Peer call timed out");
                Err(MeshError::Timeout {
                    endpoint: peer.name().to_string(),
                    after: bound,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerLinkConfig;
    use crate::metrics::NoOpSink;
    use crate::model::{Book, BookId, ChangeKind, FixedClock, Loan, ReplicaRole};
    use crate::protocol::Response;
    use crate::store::MemoryStore;
    use crate::transport::{channel, serve};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn id(raw: &str) -> BookId {
        BookId::parse(raw).unwrap()
    }

    fn catalog() -> Vec<Book> {
        vec![
            Book::available(id("100"), "Dune", "Frank Herbert"),
            Book::available(id("101"), "Emma", "Jane Austen"),
        ]
    }

    async fn replica(role: ReplicaRole, books: Vec<Book>) -> Arc<Replica> {
        let clock = Arc::new(FixedClock::at_date(NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()));
        let replica = Replica::open(
            role,
            role.as_str(),
            Arc::new(MemoryStore::new()),
            clock,
            Arc::new(NoOpSink),
            PeerLinkConfig {
                notify_timeout: "100ms".to_string(),
                sync_timeout: "200ms".to_string(),
                notify_enabled: true,
            },
        )
        .await
        .unwrap();
        replica.seed(books).await.unwrap();
        Arc::new(replica)
    }

    /// Primary and secondary wired over channels; returns the shutdown sender.
    async fn linked_pair() -> (Arc<Replica>, Arc<Replica>, watch::Sender<bool>) {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let secondary = replica(ReplicaRole::Secondary, catalog()).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (to_primary, primary_inbox) = channel::<PeerMessage, PeerReply>("primary.peer", 8);
        let (to_secondary, secondary_inbox) = channel::<PeerMessage, PeerReply>("secondary.peer", 8);
        serve(primary_inbox, primary.clone(), shutdown_rx.clone());
        serve(secondary_inbox, secondary.clone(), shutdown_rx);
        primary.link_peer(Arc::new(to_secondary)).unwrap();
        secondary.link_peer(Arc::new(to_primary)).unwrap();

        (primary, secondary, shutdown_tx)
    }

    fn remote_loan(book: &str) -> PendingChange {
        PendingChange {
            origin: ReplicaRole::Secondary,
            sequence: 1,
            timestamp_ms: 1_760_400_000_000,
            kind: ChangeKind::Loan,
            book_id: id(book),
            version: 1,
            loan: Some(Loan::new(id(book), NaiveDate::from_ymd_opt(2026, 10, 14).unwrap())),
        }
    }

    #[tokio::test]
    async fn test_apply_remote_is_idempotent() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let change = remote_loan("100");

        assert_eq!(primary.apply_remote(&change).await.unwrap(), ApplyOutcome::Applied);
        let once = primary.snapshot().await;
        assert_eq!(primary.apply_remote(&change).await.unwrap(), ApplyOutcome::AlreadyReflected);
        assert_eq!(primary.snapshot().await, once);

        // Remote applies do not enter the local log.
        assert!(once.pending.is_empty());
        assert!(once.is_consistent());
    }

    #[tokio::test]
    async fn test_older_remote_change_does_not_undo_newer_write() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let secondary = replica(ReplicaRole::Secondary, catalog()).await;
        let book = id("100");

        // Loan on the primary reaches the secondary; the secondary then returns it.
        primary.loan_book(&book).await.unwrap();
        let loan = primary.pending().await[0].clone();
        assert_eq!(secondary.apply_remote(&loan).await.unwrap(), ApplyOutcome::Applied);
        secondary.return_book(&book).await.unwrap();
        let returned = secondary.pending().await[0].clone();
        assert!(returned.book_version() > loan.book_version());

        // Both logs still hold their entry and are exchanged in either order.
        assert_eq!(primary.apply_remote(&returned).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(secondary.apply_remote(&loan).await.unwrap(), ApplyOutcome::Superseded);

        assert!(primary.active_loan(&book).await.is_none());
        assert!(secondary.active_loan(&book).await.is_none());
        assert!(primary.snapshot().await.same_circulation_state(&secondary.snapshot().await));
    }

    #[tokio::test]
    async fn test_concurrent_writes_settle_on_same_winner() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let secondary = replica(ReplicaRole::Secondary, catalog()).await;
        let book = id("100");

        primary.loan_book(&book).await.unwrap();
        secondary.apply_remote(&primary.pending().await[0]).await.unwrap();

        // Neither side sees the other's write.
        primary.renew_book(&book).await.unwrap();
        secondary.return_book(&book).await.unwrap();
        let renewal = primary.pending().await[1].clone();
        let returned = secondary.pending().await[0].clone();
        assert_eq!(renewal.version, returned.version);

        assert_eq!(primary.apply_remote(&returned).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(secondary.apply_remote(&renewal).await.unwrap(), ApplyOutcome::Superseded);
        assert!(primary.snapshot().await.same_circulation_state(&secondary.snapshot().await));
        assert!(primary.active_loan(&book).await.is_none());
    }

    #[tokio::test]
    async fn test_superseded_entries_are_acknowledged() {
        let (primary, secondary, _shutdown) = linked_pair().await;
        let book = id("100");

        primary.loan_book(&book).await.unwrap();
        secondary.return_book(&book).await.unwrap();
        assert_eq!(primary.pending_len().await, 1);
        assert_eq!(secondary.pending_len().await, 1);

        let pulled_by_secondary = secondary.reconcile().await.unwrap();
        assert_eq!(pulled_by_secondary.superseded, 1);
        assert_eq!(pulled_by_secondary.acked, 1);
        let pulled_by_primary = primary.reconcile().await.unwrap();
        assert_eq!(pulled_by_primary.already_reflected, 1);

        assert_eq!(primary.pending_len().await, 0);
        assert_eq!(secondary.pending_len().await, 0);
        assert!(primary.active_loan(&book).await.is_none());
        assert!(primary.snapshot().await.same_circulation_state(&secondary.snapshot().await));
    }

    #[tokio::test]
    async fn test_apply_remote_unknown_book() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let outcome = primary.apply_remote(&remote_loan("999")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::UnknownBook);
        assert!(!outcome.is_settled());
    }

    #[tokio::test]
    async fn test_pull_returns_sentinel_when_empty() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        assert_eq!(primary.pull_changes().await, PeerReply::NoChanges);

        primary.loan_book(&id("100")).await.unwrap();
        match primary.pull_changes().await {
            PeerReply::Changes(changes) => assert_eq!(changes.len(), 1),
            other => panic!("expected changes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_ack_keeps_remainder() {
        let secondary = replica(ReplicaRole::Secondary, catalog()).await;
        secondary.loan_book(&id("100")).await.unwrap();
        secondary.loan_book(&id("101")).await.unwrap();
        let pending = secondary.pending().await;

        let removed = secondary.ack_changes(vec![pending[0].clone()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(secondary.pending().await, vec![pending[1].clone()]);

        // Acking something that isn't there is a no-op.
        assert_eq!(secondary.ack_changes(vec![pending[0].clone()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_notify_pushes_to_peer() {
        let (primary, secondary, _shutdown) = linked_pair().await;

        primary.loan_book(&id("100")).await.unwrap();

        // Peer reflects the change, but the origin keeps its entry until acked.
        assert!(secondary.active_loan(&id("100")).await.is_some());
        assert_eq!(primary.pending_len().await, 1);
        assert_eq!(secondary.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_converges_and_clears_log() {
        let (primary, secondary, _shutdown) = linked_pair().await;

        secondary.loan_book(&id("101")).await.unwrap();
        let report = primary.reconcile().await.unwrap();
        assert_eq!(report.pulled, 1);
        // Already delivered by the push notification.
        assert_eq!(report.already_reflected, 1);
        assert_eq!(report.acked, 1);

        assert!(primary.snapshot().await.same_circulation_state(&secondary.snapshot().await));
        assert_eq!(secondary.pending_len().await, 0);

        let again = primary.reconcile().await.unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_reconcile_leaves_unknown_books_pending() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let mut wider = catalog();
        wider.push(Book::available(id("102"), "Ulysses", "James Joyce"));
        let secondary = replica(ReplicaRole::Secondary, wider).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (to_secondary, inbox) = channel::<PeerMessage, PeerReply>("secondary.peer", 8);
        serve(inbox, secondary.clone(), shutdown_rx);
        primary.link_peer(Arc::new(to_secondary)).unwrap();

        secondary.loan_book(&id("100")).await.unwrap();
        secondary.loan_book(&id("102")).await.unwrap();

        let report = primary.reconcile().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.unknown, 1);
        assert_eq!(report.acked, 1);

        let left = secondary.pending().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].book_id, id("102"));
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_without_link_is_config_error() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        assert!(matches!(primary.reconcile().await, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_notify_to_closed_peer_keeps_pending() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        let (to_secondary, inbox) = channel::<PeerMessage, PeerReply>("secondary.peer", 8);
        drop(inbox);
        primary.link_peer(Arc::new(to_secondary)).unwrap();

        let response = primary.loan_book(&id("100")).await.unwrap();
        assert!(matches!(response, Response::Granted { .. }));
        assert_eq!(primary.pending_len().await, 1);
        assert!(primary.reconcile().await.unwrap_err().is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_to_stalled_peer_is_bounded() {
        let primary = replica(ReplicaRole::Primary, catalog()).await;
        // Inbox held but never served.
        let (to_secondary, _inbox) = channel::<PeerMessage, PeerReply>("secondary.peer", 8);
        primary.link_peer(Arc::new(to_secondary)).unwrap();

        let started = tokio::time::Instant::now();
        primary.loan_book(&id("100")).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
        assert!(started.elapsed() < std::time::Duration::from_millis(200));
    }
}
