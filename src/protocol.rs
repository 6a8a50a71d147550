// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed request/response schema.
//!
//! Client text is parsed exactly once, at the dispatcher, into a [`Request`].
//! Everything downstream (actors, replicas, the topic bus) carries typed
//! values; [`Response`]'s `Display` is the single serialization point back to
//! text.
//!
//! # Wire Tokens
//!
//! ```text
//! GRANTED due=2026-10-28        loan granted
//! OK returned                   return committed
//! OK renewed due=2026-10-21     first renewal committed
//! OK new-loan due=2026-10-28    renewal of an available book, treated as a loan
//! ACCEPTED RETURN               dispatcher ack, commit happens out of band
//! AVAILABLE | LOANED            availability check
//! DENIED <reason>               business rejection, no mutation
//! NOT_FOUND                     unknown book id
//! ERROR <message>               fault (validation, transport, persistence)
//! ```

use crate::error::{MeshError, Result};
use crate::model::{BookId, BookStatus, PendingChange};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation verb of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Loan,
    Return,
    Renew,
    Availability,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loan => "LOAN",
            Self::Return => "RETURN",
            Self::Renew => "RENEW",
            Self::Availability => "AVAILABILITY",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOAN" => Ok(Self::Loan),
            "RETURN" => Ok(Self::Return),
            "RENEW" | "RENEWAL" => Ok(Self::Renew),
            "AVAILABILITY" => Ok(Self::Availability),
            "" => Err(MeshError::Validation("empty request".to_string())),
            other => Err(MeshError::Validation(format!("unknown operation {:?}", other))),
        }
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    pub book_id: BookId,
}

impl Request {
    pub fn new(operation: Operation, book_id: BookId) -> Self {
        Self { operation, book_id }
    }

    pub fn loan(book_id: BookId) -> Self {
        Self::new(Operation::Loan, book_id)
    }

    pub fn return_book(book_id: BookId) -> Self {
        Self::new(Operation::Return, book_id)
    }

    pub fn renew(book_id: BookId) -> Self {
        Self::new(Operation::Renew, book_id)
    }

    pub fn availability(book_id: BookId) -> Self {
        Self::new(Operation::Availability, book_id)
    }
}

impl FromStr for Request {
    type Err = MeshError;

    /// Accepts `VERB ID`, `VERB:ID` and `VERB,ID` (verb is case-insensitive).
    fn from_str(raw: &str) -> Result<Self> {
        let mut parts = raw
            .split(|c: char| c.is_whitespace() || c == ':' || c == ',')
            .filter(|p| !p.is_empty());

        let operation: Operation = parts
            .next()
            .ok_or_else(|| MeshError::Validation("empty request".to_string()))?
            .parse()?;
        let book_id = parts
            .next()
            .ok_or_else(|| MeshError::Validation(format!("{} requires a book id", operation)))?;
        let book_id = BookId::parse(book_id)?;

        if let Some(extra) = parts.next() {
            return Err(MeshError::Validation(format!(
                "unexpected trailing token {:?}",
                extra
            )));
        }

        Ok(Self { operation, book_id })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.book_id)
    }
}

/// Reason a replica refused an otherwise valid request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Denial {
    AlreadyLoaned,
    NotLoaned,
    RenewalCapReached,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyLoaned => "already loaned",
            Self::NotLoaned => "not loaned",
            Self::RenewalCapReached => "renewal cap reached",
        }
    }
}

/// Outcome of a request, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Granted { due_date: NaiveDate },
    Returned,
    Renewed { due_date: NaiveDate },
    RenewedAsNewLoan { due_date: NaiveDate },
    /// Dispatcher acknowledgment for asynchronously processed verbs.
    Accepted { operation: Operation },
    Status { status: BookStatus },
    Denied(Denial),
    NotFound,
    Error(String),
}

impl Response {
    pub fn error(err: &MeshError) -> Self {
        Self::Error(err.to_string())
    }

    /// No error or rejection marker.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Denied(_) | Self::NotFound | Self::Error(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted { due_date } => write!(f, "GRANTED due={}", due_date),
            Self::Returned => f.write_str("OK returned"),
            Self::Renewed { due_date } => write!(f, "OK renewed due={}", due_date),
            Self::RenewedAsNewLoan { due_date } => write!(f, "OK new-loan due={}", due_date),
            Self::Accepted { operation } => write!(f, "ACCEPTED {}", operation),
            Self::Status { status } => f.write_str(status.as_str()),
            Self::Denied(reason) => write!(f, "DENIED {}", reason.as_str()),
            Self::NotFound => f.write_str("NOT_FOUND"),
            Self::Error(message) => write!(f, "ERROR {}", message),
        }
    }
}

/// Replica-to-replica messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Best-effort push of a change just committed by the sender.
    Notify(PendingChange),
    /// Ask for the receiver's pending log.
    PullChanges,
    /// Entries the sender applied; the receiver drops exact matches.
    AckChanges(Vec<PendingChange>),
}

impl PeerMessage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Notify(_) => "NOTIFY",
            Self::PullChanges => "PULL_CHANGES",
            Self::AckChanges(_) => "ACK_CHANGES",
        }
    }
}

/// How a replica handled a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    /// Target already in the change's post-image.
    AlreadyReflected,
    /// Target holds a newer write for the book; the change is dropped.
    Superseded,
    /// Book is not in the local catalog; left unacknowledged.
    UnknownBook,
}

impl ApplyOutcome {
    /// Whether the change may be acknowledged to its origin.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyReflected | Self::Superseded)
    }
}

/// Replies to [`PeerMessage`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerReply {
    Notified(ApplyOutcome),
    /// Pending log is empty. Distinct from a malformed/empty answer.
    NoChanges,
    Changes(Vec<PendingChange>),
    Acked { removed: usize },
}
