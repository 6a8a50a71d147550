// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed replica store.
//!
//! # Schema
//!
//! ```text
//! books(id PK, title, author, status, version, version_writer)
//! loans(book_id PK, loan_date, due_date, renewal_count)
//! pending_changes(id AUTOINCREMENT, origin, sequence, timestamp_ms, operation,
//!                 book_id, version, loan_date?, due_date?, renewal_count?)
//! ```
//!
//! Dates are stored as `YYYY-MM-DD` text. The pending row's loan columns hold
//! the post-image and are NULL when the change left the book available.
//!
//! # SQLite Busy Handling
//!
//! Writes retry SQLITE_BUSY/SQLITE_LOCKED with exponential backoff (5 attempts,
//! 10ms doubling to 500ms). A commit retries the whole transaction, so a busy
//! failure half-way never leaves a partial row set behind.

use super::{Commit, ReplicaStore, Seed, Snapshot};
use crate::error::{BoxFuture, MeshError, Result};
use crate::model::{Book, BookId, ChangeKind, Loan, PendingChange, ReplicaRole, Version};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Replica store persisted in a SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    ///
    /// `":memory:"` opens a private in-memory database held on a single
    /// connection for the lifetime of the store.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let in_memory = path_str == ":memory:";
        info!(path = %path_str, wal_mode, "Opening replica store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| MeshError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        if wal_mode && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // One connection for :memory:, otherwise every connection sees its own database.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePoolOptions::new().max_connections(2).connect_with(options).await
        }
        .map_err(|e| MeshError::persistence("open", e))?;

        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                version_writer TEXT NOT NULL DEFAULT 'primary'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS loans (
                book_id TEXT PRIMARY KEY,
                loan_date TEXT NOT NULL,
                due_date TEXT NOT NULL,
                renewal_count INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pending_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                operation TEXT NOT NULL,
                book_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                loan_date TEXT,
                due_date TEXT,
                renewal_count INTEGER
            )
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| MeshError::persistence("migrate", e))?;
        }

        Ok(Self { pool, path: path_str })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        .map_err(|e| MeshError::persistence("checkpoint", e))?;
        debug!(path = %self.path, "WAL checkpoint complete");
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Snapshot> {
        let pool = &self.pool;

        let book_rows: Vec<BookRow> = sqlx::query_as(
            "SELECT id, title, author, status, version, version_writer FROM books ORDER BY id",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| MeshError::persistence("load_books", e))?;
        let loan_rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT book_id, loan_date, due_date, renewal_count FROM loans ORDER BY book_id",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| MeshError::persistence("load_loans", e))?;
        let pending_rows: Vec<PendingRow> = sqlx::query_as(
            r#"
            SELECT origin, sequence, timestamp_ms, operation, book_id, version,
                   loan_date, due_date, renewal_count
            FROM pending_changes ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| MeshError::persistence("load_pending", e))?;

        let mut snapshot = Snapshot::default();
        for row in book_rows {
            let id = corrupt("books", BookId::parse(&row.id))?;
            let version = Version {
                counter: parse_version("books", row.version)?,
                writer: corrupt("books", row.version_writer.parse::<ReplicaRole>())?,
            };
            snapshot.versions.insert(id.clone(), version);
            snapshot.books.push(Book {
                id,
                title: row.title,
                author: row.author,
                status: corrupt("books", row.status.parse())?,
            });
        }
        for (book_id, loan_date, due_date, renewal_count) in loan_rows {
            snapshot.loans.push(Loan {
                book_id: corrupt("loans", BookId::parse(&book_id))?,
                loan_date: parse_date("loans", &loan_date)?,
                due_date: parse_date("loans", &due_date)?,
                renewal_count: parse_count("loans", renewal_count)?,
            });
        }
        for row in pending_rows {
            snapshot.pending.push(row.into_change()?);
        }

        debug!(
            path = %self.path,
            books = snapshot.books.len(),
            loans = snapshot.loans.len(),
            pending = snapshot.pending.len(),
            "Loaded replica snapshot"
        );
        Ok(snapshot)
    }

    async fn insert_seeds(&self, seeds: &[Seed]) -> std::result::Result<usize, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for seed in seeds {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO books (id, title, author, status) VALUES (?, ?, ?, ?)",
            )
            .bind(seed.book.id.as_str())
            .bind(&seed.book.title)
            .bind(&seed.book.author)
            .bind(seed.book.status.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            inserted += 1;
            if let Some(loan) = &seed.loan {
                upsert_loan(&mut tx, loan).await?;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn write_commit(&self, commit: &Commit) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE books SET status = ?, version = ?, version_writer = ? WHERE id = ?")
            .bind(commit.status().as_str())
            .bind(commit.version.counter as i64)
            .bind(commit.version.writer.as_str())
            .bind(commit.book_id.as_str())
            .execute(&mut *tx)
            .await?;

        match &commit.loan {
            Some(loan) => upsert_loan(&mut tx, loan).await?,
            None => {
                sqlx::query("DELETE FROM loans WHERE book_id = ?")
                    .bind(commit.book_id.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(change) = &commit.pending {
            let loan = LoanColumns::from(change.loan.as_ref());
            sqlx::query(
                r#"
                INSERT INTO pending_changes
                    (origin, sequence, timestamp_ms, operation, book_id, version,
                     loan_date, due_date, renewal_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(change.origin.as_str())
            .bind(change.sequence as i64)
            .bind(change.timestamp_ms)
            .bind(change.kind.as_str())
            .bind(change.book_id.as_str())
            .bind(change.version as i64)
            .bind(loan.loan_date)
            .bind(loan.due_date)
            .bind(loan.renewal_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    async fn delete_pending(&self, entries: &[PendingChange]) -> std::result::Result<usize, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for change in entries {
            let loan = LoanColumns::from(change.loan.as_ref());
            // IS compares NULL post-images as equal.
            let result = sqlx::query(
                r#"
                DELETE FROM pending_changes
                WHERE origin = ? AND sequence = ? AND timestamp_ms = ? AND operation = ?
                  AND book_id = ? AND version = ?
                  AND loan_date IS ? AND due_date IS ? AND renewal_count IS ?
                "#,
            )
            .bind(change.origin.as_str())
            .bind(change.sequence as i64)
            .bind(change.timestamp_ms)
            .bind(change.kind.as_str())
            .bind(change.book_id.as_str())
            .bind(change.version as i64)
            .bind(loan.loan_date)
            .bind(loan.due_date)
            .bind(loan.renewal_count)
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }
}

impl ReplicaStore for SqliteStore {
    fn load(&self) -> BoxFuture<'_, Snapshot> {
        Box::pin(self.load_snapshot())
    }

    fn seed(&self, seeds: Vec<Seed>) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let inserted = execute_with_retry("seed", || self.insert_seeds(&seeds))
                .await
                .map_err(|e| MeshError::persistence("seed", e))?;
            if inserted > 0 {
                info!(path = %self.path, inserted, "Seeded catalog");
            }
            Ok(inserted)
        })
    }

    fn commit(&self, commit: Commit) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            execute_with_retry("commit", || self.write_commit(&commit))
                .await
                .map_err(|e| MeshError::persistence("commit", e))
        })
    }

    fn remove_pending(&self, entries: Vec<PendingChange>) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(0);
            }
            execute_with_retry("remove_pending", || self.delete_pending(&entries))
                .await
                .map_err(|e| MeshError::persistence("remove_pending", e))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.path != ":memory:" {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!(path = %self.path, "Replica store closed");
            Ok(())
        })
    }
}

async fn upsert_loan(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    loan: &Loan,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO loans (book_id, loan_date, due_date, renewal_count)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(book_id) DO UPDATE SET
            loan_date = excluded.loan_date,
            due_date = excluded.due_date,
            renewal_count = excluded.renewal_count
        "#,
    )
    .bind(loan.book_id.as_str())
    .bind(loan.loan_date.format(DATE_FORMAT).to_string())
    .bind(loan.due_date.format(DATE_FORMAT).to_string())
    .bind(loan.renewal_count as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Nullable loan columns of a pending row.
struct LoanColumns {
    loan_date: Option<String>,
    due_date: Option<String>,
    renewal_count: Option<i64>,
}

impl From<Option<&Loan>> for LoanColumns {
    fn from(loan: Option<&Loan>) -> Self {
        Self {
            loan_date: loan.map(|l| l.loan_date.format(DATE_FORMAT).to_string()),
            due_date: loan.map(|l| l.due_date.format(DATE_FORMAT).to_string()),
            renewal_count: loan.map(|l| l.renewal_count as i64),
        }
    }
}

#[derive(sqlx::FromRow)]
struct BookRow {
    id: String,
    title: String,
    author: String,
    status: String,
    version: i64,
    version_writer: String,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    origin: String,
    sequence: i64,
    timestamp_ms: i64,
    operation: String,
    book_id: String,
    version: i64,
    loan_date: Option<String>,
    due_date: Option<String>,
    renewal_count: Option<i64>,
}

impl PendingRow {
    fn into_change(self) -> Result<PendingChange> {
        let book_id = corrupt("pending_changes", BookId::parse(&self.book_id))?;
        let loan = match (self.loan_date, self.due_date, self.renewal_count) {
            (Some(loan_date), Some(due_date), Some(count)) => Some(Loan {
                book_id: book_id.clone(),
                loan_date: parse_date("pending_changes", &loan_date)?,
                due_date: parse_date("pending_changes", &due_date)?,
                renewal_count: parse_count("pending_changes", count)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(MeshError::persistence_msg(
                    "load_pending",
                    format!("partial loan columns for {}", book_id),
                ))
            }
        };
        Ok(PendingChange {
            origin: corrupt("pending_changes", self.origin.parse())?,
            sequence: u64::try_from(self.sequence).map_err(|_| {
                MeshError::persistence_msg("load_pending", format!("negative sequence {}", self.sequence))
            })?,
            timestamp_ms: self.timestamp_ms,
            kind: corrupt("pending_changes", self.operation.parse::<ChangeKind>())?,
            book_id,
            version: parse_version("pending_changes", self.version)?,
            loan,
        })
    }
}

fn corrupt<T>(table: &str, value: Result<T>) -> Result<T> {
    value.map_err(|e| MeshError::persistence_msg(format!("load_{}", table), e.to_string()))
}

fn parse_date(table: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| MeshError::persistence_msg(format!("load_{}", table), format!("bad date {:?}: {}", raw, e)))
}

fn parse_version(table: &str, raw: i64) -> Result<u64> {
    u64::try_from(raw)
        .map_err(|_| MeshError::persistence_msg(format!("load_{}", table), format!("negative version {}", raw)))
}

fn parse_count(table: &str, raw: i64) -> Result<u8> {
    match u8::try_from(raw) {
        Ok(count @ 1..=2) => Ok(count),
        _ => Err(MeshError::persistence_msg(
            format!("load_{}", table),
            format!("renewal count {} out of range", raw),
        )),
    }
}
