// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Circulation Mesh
//!
//! Fault-tolerant request routing and dual-replica storage for library
//! circulation: loans, returns, renewals and availability checks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                             circulation-mesh                               │
//! │                                                                            │
//! │  ┌────────────┐  LOAN/AVAILABILITY  ┌────────────┐  ≤ timeout  ┌─────────┐  │
//! │  │ Dispatcher │────────────────────►│ LoanActor  │────────────►│ Primary │  │
//! │  │ (parse +   │                     └────────────┘   fallback  │ Replica │  │
//! │  │  route)    │  RETURN/RENEWAL     ┌────────────┐  ┌─────────►└────┬────┘  │
//! │  │            │──► TopicBus ───────►│ ReturnRen. │──┘               │ notify│
//! │  └────────────┘                     │ Actor      │────────────►┌────┴────┐  │
//! │                                     └────────────┘             │Secondary│  │
//! │                                                                │ Replica │  │
//! │                                                                └─────────┘  │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Reconciliation
//!
//! 1. **Push**: a replica that commits a mutation notifies its peer inline,
//!    bounded by a short timeout.
//! 2. **Pull/ack**: periodically (and on demand) each replica pulls its peer's
//!    pending-change log, applies it idempotently and acks what it applied.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use circulation_mesh::{Mesh, MeshConfig};
//!
//! #[tokio::main]
//! async fn main() -> circulation_mesh::Result<()> {
//!     let mut config = MeshConfig::default();
//!     config.catalog.push("100, Dune, Frank Herbert".into());
//!
//!     let mut mesh = Mesh::new(config);
//!     mesh.start().await?;
//!     println!("{}", mesh.submit("LOAN 100").await?);
//!     mesh.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod replica;
pub mod resilience;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use actor::{Completion, LoanActor, ReturnRenewalActor};
pub use bus::{Topic, TopicBus};
pub use config::{ActorConfig, ChannelConfig, MeshConfig, PeerLinkConfig, ReconcileConfig, ReplicaConfig};
pub use coordinator::{Mesh, MeshHealth, MeshState, ReplicaHealth};
pub use dispatcher::Dispatcher;
pub use error::{MeshError, Result};
pub use metrics::{MemorySink, MetricsSink, MetricsSummary, NoOpSink, RecorderSink, Sample};
pub use model::{Book, BookId, BookStatus, Clock, FixedClock, Loan, PendingChange, ReplicaRole, SystemClock};
pub use protocol::{Operation, Request, Response};
pub use replica::{ReconcileReport, Replica};
pub use resilience::ResilientCall;
pub use store::{MemoryStore, ReplicaStore, SqliteStore};
pub use transport::Endpoint;
