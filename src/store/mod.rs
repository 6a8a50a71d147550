// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable backing for a replica.
//!
//! A replica keeps its working state in memory and treats the store as the
//! source of truth across restarts. Every mutation reaches the store as one
//! [`Commit`]: the book's new status and version, its loan row (upserted or
//! deleted), and optionally the pending-change entry that records it. Implementations must
//! apply a commit atomically; the replica only touches memory after
//! [`ReplicaStore::commit`] returns `Ok`.
//!
//! # Implementations
//!
//! - [`SqliteStore`]: sqlx/SQLite, WAL mode, bounded busy retry
//! - [`MemoryStore`]: in-process maps with failure injection for tests

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::BoxFuture;
use crate::model::{Book, BookId, BookStatus, Loan, PendingChange, Version};
use std::collections::BTreeMap;

/// Everything a replica needs to rebuild its in-memory state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub books: Vec<Book>,
    pub loans: Vec<Loan>,
    /// Version of every book in `books`.
    pub versions: BTreeMap<BookId, Version>,
    /// Unacknowledged changes in append order.
    pub pending: Vec<PendingChange>,
}

impl Snapshot {
    /// Every book is `LOANED` iff a loan row exists for it, and no loan is orphaned.
    pub fn is_consistent(&self) -> bool {
        let books_ok = self.books.iter().all(|book| {
            let has_loan = self.loans.iter().any(|loan| loan.book_id == book.id);
            has_loan == (book.status == BookStatus::Loaned)
        });
        let loans_ok = self.loans.iter().all(|loan| {
            (1..=crate::model::MAX_RENEWAL_COUNT).contains(&loan.renewal_count)
                && self.books.iter().any(|book| book.id == loan.book_id)
        });
        books_ok && loans_ok
    }

    /// Catalog, loan table and book versions, ignoring the pending log.
    pub fn same_circulation_state(&self, other: &Snapshot) -> bool {
        self.books == other.books && self.loans == other.loans && self.versions == other.versions
    }
}

/// One atomic mutation of a single book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub book_id: BookId,
    /// Loan row after the mutation; `None` deletes it.
    pub loan: Option<Loan>,
    /// Book version after the mutation.
    pub version: Version,
    /// Entry appended to the pending log. Remote applies leave this empty.
    pub pending: Option<PendingChange>,
}

impl Commit {
    /// Book status implied by the loan post-image.
    pub fn status(&self) -> BookStatus {
        if self.loan.is_some() {
            BookStatus::Loaned
        } else {
            BookStatus::Available
        }
    }
}

/// Catalog entry to insert when absent, with the loan a `LOANED` seed implies.
///
/// Seeded books start at [`Version::SEED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub book: Book,
    pub loan: Option<Loan>,
}

/// Durable storage backend for one replica.
pub trait ReplicaStore: Send + Sync + 'static {
    /// Read the full persisted state.
    fn load(&self) -> BoxFuture<'_, Snapshot>;

    /// Insert books that are not yet present. Returns how many were inserted.
    ///
    /// Existing rows are never overwritten.
    fn seed(&self, seeds: Vec<Seed>) -> BoxFuture<'_, usize>;

    /// Apply one mutation atomically.
    fn commit(&self, commit: Commit) -> BoxFuture<'_, ()>;

    /// Remove exact matches from the pending log. Returns how many were removed.
    fn remove_pending(&self, entries: Vec<PendingChange>) -> BoxFuture<'_, usize>;

    /// Flush and release resources.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
