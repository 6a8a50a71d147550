// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the circulation mesh.
//!
//! Configuration is passed to [`Mesh::new()`](crate::Mesh::new) and can be
//! constructed programmatically or deserialized from JSON/YAML. Every field
//! has a default, so `{}` is a valid (SQLite-file backed) configuration.
//!
//! # Quick Start
//!
//! ```rust
//! use circulation_mesh::config::MeshConfig;
//!
//! let mut config = MeshConfig::for_testing();
//! config.catalog.push("100, Dune, Frank Herbert".into());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MeshConfig
//! ├── primary: ReplicaConfig      # authoritative replica storage
//! ├── secondary: ReplicaConfig    # fallback replica storage
//! ├── actor: ActorConfig          # primary timeout for operation actors
//! ├── peer: PeerLinkConfig        # replica-to-replica notify/sync bounds
//! ├── reconcile: ReconcileConfig  # periodic pull/ack rounds
//! ├── channels: ChannelConfig     # queue capacities
//! └── catalog: Vec<String>        # seed lines "id, title, author[, status]"
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "primary":   { "name": "primary",   "sqlite_path": "/var/lib/circulation/primary.db" },
//!   "secondary": { "name": "secondary", "sqlite_path": "/var/lib/circulation/secondary.db" },
//!   "actor":     { "primary_timeout": "3s" },
//!   "peer":      { "notify_timeout": "1s" },
//!   "reconcile": { "interval_sec": 30 },
//!   "catalog":   ["100, Dune, Frank Herbert", "101, Emma, Jane Austen, LOANED"]
//! }
//! ```

use crate::error::{MeshError, Result};
use crate::model::{Book, ReplicaRole};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// The top-level config object passed to `Mesh::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "ReplicaConfig::default_primary")]
    pub primary: ReplicaConfig,

    #[serde(default = "ReplicaConfig::default_secondary")]
    pub secondary: ReplicaConfig,

    #[serde(default)]
    pub actor: ActorConfig,

    #[serde(default)]
    pub peer: PeerLinkConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub channels: ChannelConfig,

    /// Seed lines inserted into both replicas on start when absent.
    #[serde(default)]
    pub catalog: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            primary: ReplicaConfig::default_primary(),
            secondary: ReplicaConfig::default_secondary(),
            actor: ActorConfig::default(),
            peer: PeerLinkConfig::default(),
            reconcile: ReconcileConfig::default(),
            channels: ChannelConfig::default(),
            catalog: Vec::new(),
        }
    }
}

impl MeshConfig {
    /// In-memory replicas, periodic reconcile off, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            primary: ReplicaConfig::in_memory("primary"),
            secondary: ReplicaConfig::in_memory("secondary"),
            actor: ActorConfig {
                primary_timeout: "200ms".to_string(),
            },
            peer: PeerLinkConfig {
                notify_timeout: "100ms".to_string(),
                sync_timeout: "200ms".to_string(),
                notify_enabled: true,
            },
            reconcile: ReconcileConfig {
                enabled: false,
                interval_sec: default_reconcile_interval_sec(),
            },
            channels: ChannelConfig::default(),
            catalog: Vec::new(),
        }
    }

    pub fn replica(&self, role: ReplicaRole) -> &ReplicaConfig {
        match role {
            ReplicaRole::Primary => &self.primary,
            ReplicaRole::Secondary => &self.secondary,
        }
    }

    /// Parse the catalog seed lines.
    pub fn seed_books(&self) -> Result<Vec<Book>> {
        let mut seen = HashSet::new();
        let mut books = Vec::with_capacity(self.catalog.len());
        for line in self.catalog.iter().filter(|l| !l.trim().is_empty()) {
            let book = Book::parse_seed_line(line)
                .map_err(|e| MeshError::Config(format!("catalog: {}", e)))?;
            if !seen.insert(book.id.clone()) {
                return Err(MeshError::Config(format!("catalog: duplicate book id {}", book.id)));
            }
            books.push(book);
        }
        Ok(books)
    }

    /// Reject configurations that cannot produce a working mesh.
    pub fn validate(&self) -> Result<()> {
        if self.primary.sqlite_path != ":memory:" && self.primary.sqlite_path == self.secondary.sqlite_path {
            return Err(MeshError::Config(format!(
                "primary and secondary share sqlite_path {}",
                self.primary.sqlite_path
            )));
        }
        if self.primary.name == self.secondary.name {
            return Err(MeshError::Config(format!(
                "primary and secondary share name {}",
                self.primary.name
            )));
        }
        self.seed_books()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig: durable storage for one replica
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage settings for one replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Name used in endpoint names and log fields.
    pub name: String,

    /// SQLite database file, or `":memory:"`.
    pub sqlite_path: String,

    /// Enable SQLite WAL mode (ignored for `:memory:`).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl ReplicaConfig {
    fn default_primary() -> Self {
        Self {
            name: "primary".to_string(),
            sqlite_path: "circulation_primary.db".to_string(),
            wal_mode: true,
        }
    }

    fn default_secondary() -> Self {
        Self {
            name: "secondary".to_string(),
            sqlite_path: "circulation_secondary.db".to_string(),
            wal_mode: true,
        }
    }

    /// In-memory storage (for testing).
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ActorConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// How long an operation actor waits on the primary as a duration string
    /// (e.g., "3s"). The secondary attempt has no bound.
    #[serde(default = "default_primary_timeout")]
    pub primary_timeout: String,
}

fn default_primary_timeout() -> String {
    "3s".to_string()
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            primary_timeout: default_primary_timeout(),
        }
    }
}

impl ActorConfig {
    /// Parse the primary timeout (3s when invalid).
    pub fn primary_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.primary_timeout).unwrap_or(Duration::from_secs(3))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerLinkConfig: replica ↔ replica
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLinkConfig {
    /// Bound on one push notification (e.g., "1s").
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout: String,

    /// Bound on one PULL_CHANGES or ACK_CHANGES exchange.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: String,

    /// Push each committed change to the peer.
    #[serde(default = "default_true")]
    pub notify_enabled: bool,
}

fn default_notify_timeout() -> String {
    "1s".to_string()
}

fn default_sync_timeout() -> String {
    "3s".to_string()
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            notify_timeout: default_notify_timeout(),
            sync_timeout: default_sync_timeout(),
            notify_enabled: true,
        }
    }
}

impl PeerLinkConfig {
    /// Parse the notify timeout (1s when invalid).
    pub fn notify_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.notify_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// Parse the sync timeout (3s when invalid).
    pub fn sync_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.sync_timeout).unwrap_or(Duration::from_secs(3))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig: periodic pull/ack
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between rounds.
    #[serde(default = "default_reconcile_interval_sec")]
    pub interval_sec: u64,
}

fn default_reconcile_interval_sec() -> u64 {
    30
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: default_reconcile_interval_sec(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of each request/response inbox.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Capacity of each topic bus subscriber queue.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// How long a publish waits for a full subscriber queue (e.g., "10s").
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: String,
}

fn default_request_capacity() -> usize {
    64
}

fn default_bus_capacity() -> usize {
    256
}

fn default_publish_timeout() -> String {
    "10s".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            bus_capacity: default_bus_capacity(),
            publish_timeout: default_publish_timeout(),
        }
    }
}

impl ChannelConfig {
    /// Parse the publish timeout (10s when invalid).
    pub fn publish_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.publish_timeout).unwrap_or(Duration::from_secs(10))
    }
}

fn default_true() -> bool {
    true
}
