// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mesh lifecycle and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!                                  │
//!                 (store or seed   │ (replicas linked,
//!                  failure)        │  listeners up)
//!                     ↓            ↓
//!                  Failed       Running
//!                                  │
//!                        shutdown()│
//!                                  ↓
//!                            ShuttingDown ──→ Stopped
//! ```
//!
//! - **Created**: after `Mesh::new()`. Nothing opened.
//! - **Starting**: stores open, catalog seeding, tasks spawning.
//! - **Running**: client requests accepted.
//! - **ShuttingDown**: tasks signalled, stores closing.
//! - **Stopped**: clean stop. Safe to drop.
//! - **Failed**: startup did not complete. Check logs.

use crate::model::ReplicaRole;

/// State of the circulation mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl MeshState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshState::Created => "Created",
            MeshState::Starting => "Starting",
            MeshState::Running => "Running",
            MeshState::ShuttingDown => "ShuttingDown",
            MeshState::Stopped => "Stopped",
            MeshState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health of the whole mesh.
///
/// Built from cached state only; no request goes through the mesh to
/// produce it.
#[derive(Debug, Clone)]
pub struct MeshHealth {
    pub state: MeshState,
    /// Running and at least one replica reachable.
    pub ready: bool,
    /// Running and both replicas reachable.
    pub healthy: bool,
    pub replicas: Vec<ReplicaHealth>,
}

impl MeshHealth {
    pub fn replica(&self, role: ReplicaRole) -> Option<&ReplicaHealth> {
        self.replicas.iter().find(|r| r.role == role)
    }
}

/// Health of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaHealth {
    pub role: ReplicaRole,
    pub name: String,
    /// False while the replica is stopped via `stop_replica`.
    pub reachable: bool,
    pub linked: bool,
    pub books: usize,
    pub active_loans: usize,
    /// Entries waiting for the peer's acknowledgment.
    pub pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_state_display() {
        assert_eq!(MeshState::Created.to_string(), "Created");
        assert_eq!(MeshState::Starting.to_string(), "Starting");
        assert_eq!(MeshState::Running.to_string(), "Running");
        assert_eq!(MeshState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(MeshState::Stopped.to_string(), "Stopped");
        assert_eq!(MeshState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_health_lookup_by_role() {
        let health = MeshHealth {
            state: MeshState::Running,
            ready: true,
            healthy: false,
            replicas: vec![ReplicaHealth {
                role: ReplicaRole::Secondary,
                name: "secondary".into(),
                reachable: true,
                linked: true,
                books: 3,
                active_loans: 1,
                pending: 1,
            }],
        };
        assert_eq!(health.replica(ReplicaRole::Secondary).map(|r| r.pending), Some(1));
        assert!(health.replica(ReplicaRole::Primary).is_none());
    }
}
