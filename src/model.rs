// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circulation data model: books, loans, and the pending-change log entries
//! replicas exchange during reconciliation.
//!
//! # Invariants
//!
//! - A book is `LOANED` if and only if a [`Loan`] exists for its id.
//! - `Loan::renewal_count` is 1 or 2; [`Loan::renewed`] refuses to go past 2.
//! - A [`PendingChange`] carries the loan *post-image* of the book it touched,
//!   so replaying it is idempotent: the target ends in exactly that state.
//! - Every book carries a [`Version`]. A write bumps it past the local one, and
//!   a remote change lands only when its version is newer, so two replicas
//!   that exchange their logs settle on the same write per book.

use crate::error::{MeshError, Result};
use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Length of a fresh loan.
pub const LOAN_PERIOD_DAYS: u64 = 14;

/// Extension granted by the single allowed renewal.
pub const RENEWAL_PERIOD_DAYS: u64 = 7;

/// A loan at this count can no longer be renewed.
pub const MAX_RENEWAL_COUNT: u8 = 2;

const MAX_BOOK_ID_LEN: usize = 64;

/// Validated book identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookId(String);

impl BookId {
    /// Parse and validate a raw id (surrounding whitespace is ignored).
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(MeshError::Validation("missing book id".to_string()));
        }
        if id.len() > MAX_BOOK_ID_LEN {
            return Err(MeshError::Validation(format!(
                "book id longer than {} characters",
                MAX_BOOK_ID_LEN
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(MeshError::Validation(format!(
                "book id {:?} contains invalid character {:?}",
                id, bad
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BookId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BookId {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BookId> for String {
    fn from(id: BookId) -> Self {
        id.0
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Availability of a single book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookStatus {
    Available,
    Loaned,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Loaned => "LOANED",
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookStatus {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(Self::Available),
            "LOANED" => Ok(Self::Loaned),
            other => Err(MeshError::Validation(format!("unknown book status {:?}", other))),
        }
    }
}

/// A catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub status: BookStatus,
}

impl Book {
    /// A new, available book.
    pub fn available(id: BookId, title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            author: author.into(),
            status: BookStatus::Available,
        }
    }

    /// Parse a catalog seed line: `id, title, author, status`.
    ///
    /// The status column is optional and defaults to `AVAILABLE`.
    pub fn parse_seed_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(4, ',').map(str::trim).collect();
        if parts.len() < 3 {
            return Err(MeshError::Validation(format!(
                "catalog line needs at least id, title, author: {:?}",
                line
            )));
        }
        let status = match parts.get(3) {
            Some(raw) if !raw.is_empty() => raw.parse()?,
            _ => BookStatus::Available,
        };
        Ok(Self {
            id: BookId::parse(parts[0])?,
            title: parts[1].to_string(),
            author: parts[2].to_string(),
            status,
        })
    }
}

/// An active loan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Loan {
    pub book_id: BookId,
    pub loan_date: NaiveDate,
    pub due_date: NaiveDate,
    pub renewal_count: u8,
}

impl Loan {
    /// A fresh loan starting `today`.
    pub fn new(book_id: BookId, today: NaiveDate) -> Self {
        Self {
            book_id,
            loan_date: today,
            due_date: add_days(today, LOAN_PERIOD_DAYS),
            renewal_count: 1,
        }
    }

    /// The loan after one renewal on `today`, or `None` at the cap.
    pub fn renewed(&self, today: NaiveDate) -> Option<Self> {
        if self.renewal_count >= MAX_RENEWAL_COUNT {
            return None;
        }
        Some(Self {
            book_id: self.book_id.clone(),
            loan_date: self.loan_date,
            due_date: add_days(today, RENEWAL_PERIOD_DAYS),
            renewal_count: self.renewal_count + 1,
        })
    }
}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

/// Kind of committed mutation recorded in the pending log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Loan,
    Return,
    Renewal,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loan => "LOAN",
            Self::Return => "RETURN",
            Self::Renewal => "RENEWAL",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOAN" => Ok(Self::Loan),
            "RETURN" => Ok(Self::Return),
            "RENEWAL" => Ok(Self::Renewal),
            other => Err(MeshError::Validation(format!("unknown change kind {:?}", other))),
        }
    }
}

/// Which of the two replica instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Primary,
    Secondary,
}

impl ReplicaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaRole {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(MeshError::Validation(format!("unknown replica role {:?}", other))),
        }
    }
}

/// Per-book write version.
///
/// Ordered by `counter`, then by `writer`; the tie-break only matters for
/// two writes made concurrently on different replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub counter: u64,
    pub writer: ReplicaRole,
}

impl Version {
    /// Version of a freshly seeded book.
    pub const SEED: Self = Self {
        counter: 0,
        writer: ReplicaRole::Primary,
    };

    /// The version a write by `writer` on top of this one gets.
    pub fn next(self, writer: ReplicaRole) -> Self {
        Self {
            counter: self.counter.saturating_add(1),
            writer,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::SEED
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}", self.counter, self.writer)
    }
}

/// A committed mutation awaiting peer acknowledgment.
///
/// Identity is the full content: two entries are the same entry only if every
/// field matches. `loan` is the book's loan after the mutation (`None` means
/// the book is available). `version` is the book's version counter after the
/// mutation; the writer is `origin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingChange {
    pub origin: ReplicaRole,
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub kind: ChangeKind,
    pub book_id: BookId,
    pub version: u64,
    pub loan: Option<Loan>,
}

impl PendingChange {
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_default()
    }

    /// Version the book has once this change is applied.
    pub fn book_version(&self) -> Version {
        Version {
            counter: self.version,
            writer: self.origin,
        }
    }
}

impl fmt::Display for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} {} {} {} {}",
            self.origin,
            self.sequence,
            self.timestamp().format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.book_id,
            self.book_version()
        )
    }
}

/// Source of "now" for loan dates and change timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day loans are dated with.
    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Start at midnight UTC of the given day.
    pub fn at_date(date: NaiveDate) -> Self {
        Self::new(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::default())))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_book_id_accepts_common_forms() {
        assert_eq!(BookId::parse("100").unwrap().as_str(), "100");
        assert_eq!(BookId::parse("  9780134685991 ").unwrap().as_str(), "9780134685991");
        assert_eq!(BookId::parse("isbn-978_0.1").unwrap().as_str(), "isbn-978_0.1");
    }

    #[test]
    fn test_book_id_rejects_garbage() {
        assert!(BookId::parse("").is_err());
        assert!(BookId::parse("   ").is_err());
        assert!(BookId::parse("10 0").is_err());
        assert!(BookId::parse("100:200").is_err());
        assert!(BookId::parse(&"9".repeat(65)).is_err());
    }

    #[test]
    fn test_book_id_serde_validates() {
        let ok: BookId = serde_json::from_str("\"100\"").unwrap();
        assert_eq!(ok.as_str(), "100");
        assert!(serde_json::from_str::<BookId>("\"1 00\"").is_err());
    }

    #[test]
    fn test_new_loan_is_fourteen_days() {
        let loan = Loan::new(BookId::parse("100").unwrap(), date(2026, 10, 14));
        assert_eq!(loan.loan_date, date(2026, 10, 14));
        assert_eq!(loan.due_date, date(2026, 10, 28));
        assert_eq!(loan.renewal_count, 1);
    }

    #[test]
    fn test_renewal_moves_due_date_from_today() {
        let loan = Loan::new(BookId::parse("100").unwrap(), date(2026, 10, 1));
        let renewed = loan.renewed(date(2026, 10, 10)).unwrap();
        assert_eq!(renewed.loan_date, date(2026, 10, 1));
        assert_eq!(renewed.due_date, date(2026, 10, 17));
        assert_eq!(renewed.renewal_count, 2);
    }

    #[test]
    fn test_renewal_capped_at_two() {
        let loan = Loan::new(BookId::parse("100").unwrap(), date(2026, 10, 1));
        let renewed = loan.renewed(date(2026, 10, 2)).unwrap();
        assert!(renewed.renewed(date(2026, 10, 3)).is_none());
    }

    #[test]
    fn test_parse_seed_line() {
        let book = Book::parse_seed_line("100, Dune, Frank Herbert, LOANED").unwrap();
        assert_eq!(book.id.as_str(), "100");
        assert_eq!(book.title, "Dune");
        assert_eq!(book.author, "Frank Herbert");
        assert_eq!(book.status, BookStatus::Loaned);

        let book = Book::parse_seed_line("101, Emma, Jane Austen").unwrap();
        assert_eq!(book.status, BookStatus::Available);
    }

    #[test]
    fn test_parse_seed_line_rejects_short_lines() {
        assert!(Book::parse_seed_line("100, Dune").is_err());
        assert!(Book::parse_seed_line("100, Dune, Herbert, BORROWED").is_err());
    }

    #[test]
    fn test_change_kind_and_role_strings() {
        for kind in [ChangeKind::Loan, ChangeKind::Return, ChangeKind::Renewal] {
            assert_eq!(kind.as_str().parse::<ChangeKind>().unwrap(), kind);
        }
        assert_eq!("secondary".parse::<ReplicaRole>().unwrap(), ReplicaRole::Secondary);
    }

    #[test]
    fn test_pending_change_carries_writer_version() {
        let id = BookId::parse("100").unwrap();
        let change = PendingChange {
            origin: ReplicaRole::Secondary,
            sequence: 1,
            timestamp_ms: 1_700_000_000_000,
            kind: ChangeKind::Loan,
            book_id: id.clone(),
            version: 3,
            loan: Some(Loan::new(id, date(2026, 10, 14))),
        };
        assert_eq!(
            change.book_version(),
            Version { counter: 3, writer: ReplicaRole::Secondary }
        );
        let shown = change.to_string();
        assert!(shown.contains("secondary#1"));
        assert!(shown.ends_with("v3@secondary"));
    }

    #[test]
    fn test_version_orders_by_counter_then_writer() {
        let seed = Version::SEED;
        let primary = seed.next(ReplicaRole::Primary);
        let secondary = seed.next(ReplicaRole::Secondary);

        assert!(seed < primary);
        // Same counter: concurrent writes, secondary wins.
        assert!(primary < secondary);
        assert!(secondary < secondary.next(ReplicaRole::Primary));
        assert_eq!(Version::default(), seed);
    }

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::at_date(date(2026, 10, 14));
        assert_eq!(clock.today(), date(2026, 10, 14));
        clock.advance(chrono::Duration::days(3));
        assert_eq!(clock.today(), date(2026, 10, 17));
    }
}
