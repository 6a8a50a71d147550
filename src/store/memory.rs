// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process replica store for tests.

use super::{Commit, ReplicaStore, Seed, Snapshot};
use crate::error::{BoxFuture, MeshError};
use crate::model::{Book, BookId, Loan, PendingChange, Version};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    books: BTreeMap<BookId, Book>,
    loans: BTreeMap<BookId, Loan>,
    versions: BTreeMap<BookId, Version>,
    pending: Vec<PendingChange>,
}

/// Map-backed store. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_commits: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `commit` and `remove_pending` fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn failing(&self, operation: &str) -> Option<MeshError> {
        self.fail_commits
            .load(Ordering::SeqCst)
            .then(|| MeshError::persistence_msg(operation, "injected write failure"))
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ReplicaStore for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Snapshot> {
        Box::pin(async move {
            let tables = self.tables();
            Ok(Snapshot {
                books: tables.books.values().cloned().collect(),
                loans: tables.loans.values().cloned().collect(),
                versions: tables.versions.clone(),
                pending: tables.pending.clone(),
            })
        })
    }

    fn seed(&self, seeds: Vec<Seed>) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut tables = self.tables();
            let mut inserted = 0;
            for seed in seeds {
                if tables.books.contains_key(&seed.book.id) {
                    continue;
                }
                if let Some(loan) = seed.loan {
                    tables.loans.insert(loan.book_id.clone(), loan);
                }
                tables.versions.insert(seed.book.id.clone(), Version::SEED);
                tables.books.insert(seed.book.id.clone(), seed.book);
                inserted += 1;
            }
            Ok(inserted)
        })
    }

    fn commit(&self, commit: Commit) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(err) = self.failing("commit") {
                return Err(err);
            }
            let status = commit.status();
            let mut tables = self.tables();
            if let Some(book) = tables.books.get_mut(&commit.book_id) {
                book.status = status;
            }
            if tables.books.contains_key(&commit.book_id) {
                tables.versions.insert(commit.book_id.clone(), commit.version);
            }
            match commit.loan {
                Some(loan) => {
                    tables.loans.insert(commit.book_id.clone(), loan);
                }
                None => {
                    tables.loans.remove(&commit.book_id);
                }
            }
            if let Some(change) = commit.pending {
                tables.pending.push(change);
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn remove_pending(&self, entries: Vec<PendingChange>) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            if let Some(err) = self.failing("remove_pending") {
                return Err(err);
            }
            let mut tables = self.tables();
            let before = tables.pending.len();
            tables.pending.retain(|change| !entries.contains(change));
            Ok(before - tables.pending.len())
        })
    }
}
