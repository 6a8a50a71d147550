// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary-then-secondary call with a bounded primary wait.
//!
//! ```text
//! call(req) ──▶ primary (≤ primary_timeout) ──Ok──────────────▶ Answered { served_by: Primary }
//!                  │ Timeout / Transport
//!                  ▼
//!               secondary (unbounded) ──Ok───────────────────▶ Answered { served_by: Secondary }
//!                  │ Timeout / Transport
//!                  ▼
//!               MeshError::Unavailable
//! ```
//!
//! Exactly one attempt per replica. Any other error from the primary (a
//! persistence failure, say) means the primary *answered*: it is returned
//! without touching the secondary.
//!
//! A timed-out primary keeps processing the request it was handed; the
//! replicas absorb the resulting double apply through reconciliation.

use crate::error::{MeshError, Result};
use crate::metrics;
use crate::model::ReplicaRole;
use crate::transport::Endpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// An answer and the replica that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answered<Rep> {
    pub response: Rep,
    pub served_by: ReplicaRole,
}

/// Reusable fallback caller shared by the operation actors.
pub struct ResilientCall<Req, Rep> {
    component: String,
    primary: Arc<dyn Endpoint<Req, Rep>>,
    secondary: Arc<dyn Endpoint<Req, Rep>>,
    primary_timeout: Duration,
}

impl<Req, Rep> Clone for ResilientCall<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            component: self.component.clone(),
            primary: Arc::clone(&self.primary),
            secondary: Arc::clone(&self.secondary),
            primary_timeout: self.primary_timeout,
        }
    }
}

impl<Req, Rep> ResilientCall<Req, Rep>
where
    Req: Clone + Send,
    Rep: Send,
{
    pub fn new(
        component: impl Into<String>,
        primary: Arc<dyn Endpoint<Req, Rep>>,
        secondary: Arc<dyn Endpoint<Req, Rep>>,
        primary_timeout: Duration,
    ) -> Self {
        Self {
            component: component.into(),
            primary,
            secondary,
            primary_timeout,
        }
    }

    pub async fn call(&self, request: Req) -> Result<Answered<Rep>> {
        let primary_err = match timeout(self.primary_timeout, self.primary.call(request.clone())).await {
            Ok(Ok(response)) => {
                return Ok(Answered {
                    response,
                    served_by: ReplicaRole::Primary,
                })
            }
            Ok(Err(e)) if !e.is_transport() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => MeshError::Timeout {
                endpoint: self.primary.name().to_string(),
                after: self.primary_timeout,
            },
        };

        warn!(
            component = %self.component,
            endpoint = %self.primary.name(),
            error = %primary_err,
            "Primary unreachable, falling back to secondary"
        );

        match self.secondary.call(request).await {
            Ok(response) => {
                metrics::record_fallback(&self.component, primary_err.kind(), "secondary");
                debug!(component = %self.component, endpoint = %self.secondary.name(), "Served by secondary");
                Ok(Answered {
                    response,
                    served_by: ReplicaRole::Secondary,
                })
            }
            Err(secondary_err) if secondary_err.is_transport() => {
                metrics::record_fallback(&self.component, primary_err.kind(), "unavailable");
                warn!(
                    component = %self.component,
                    endpoint = %self.secondary.name(),
                    error = %secondary_err,
                    "Secondary unreachable as well"
                );
                Err(MeshError::Unavailable {
                    primary: primary_err.to_string(),
                    secondary: secondary_err.to_string(),
                })
            }
            Err(secondary_err) => {
                metrics::record_fallback(&self.component, primary_err.kind(), "secondary");
                Err(secondary_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Answer(&'static str),
        Stall,
        Closed,
        Persistence,
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Endpoint<String, String> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn call(&self, request: String) -> BoxFuture<'_, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match self.behaviour {
                    Behaviour::Answer(prefix) => Ok(format!("{}:{}", prefix, request)),
                    Behaviour::Stall => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                    Behaviour::Closed => Err(MeshError::transport(self.name, "endpoint closed")),
                    Behaviour::Persistence => Err(MeshError::persistence_msg("commit", "disk full")),
                }
            })
        }
    }

    fn caller(primary: Arc<Scripted>, secondary: Arc<Scripted>) -> ResilientCall<String, String> {
        ResilientCall::new("test_actor", primary, secondary, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_primary_answer_wins() {
        let primary = Scripted::new("primary", Behaviour::Answer("p"));
        let secondary = Scripted::new("secondary", Behaviour::Answer("s"));
        let answered = caller(primary.clone(), secondary.clone()).call("LOAN 1".into()).await.unwrap();

        assert_eq!(answered.response, "p:LOAN 1");
        assert_eq!(answered.served_by, ReplicaRole::Primary);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_falls_back_once() {
        let primary = Scripted::new("primary", Behaviour::Stall);
        let secondary = Scripted::new("secondary", Behaviour::Answer("s"));
        let answered = caller(primary.clone(), secondary.clone()).call("LOAN 1".into()).await.unwrap();

        assert_eq!(answered.response, "s:LOAN 1");
        assert_eq!(answered.served_by, ReplicaRole::Secondary);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_falls_back_immediately() {
        let primary = Scripted::new("primary", Behaviour::Closed);
        let secondary = Scripted::new("secondary", Behaviour::Answer("s"));
        let answered = caller(primary, secondary).call("RETURN 1".into()).await.unwrap();
        assert_eq!(answered.served_by, ReplicaRole::Secondary);
    }

    #[tokio::test]
    async fn test_persistence_error_is_not_retried() {
        let primary = Scripted::new("primary", Behaviour::Persistence);
        let secondary = Scripted::new("secondary", Behaviour::Answer("s"));
        let err = caller(primary, secondary.clone()).call("LOAN 1".into()).await.unwrap_err();

        assert_eq!(err.kind(), "persistence");
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_unreachable() {
        let primary = Scripted::new("primary", Behaviour::Stall);
        let secondary = Scripted::new("secondary", Behaviour::Closed);
        let err = caller(primary, secondary).call("LOAN 1".into()).await.unwrap_err();

        assert!(matches!(err, MeshError::Unavailable { .. }));
        let msg = err.to_string();
        assert!(msg.starts_with("neither replica reachable"));
        assert!(msg.contains("timeout"));
        assert!(msg.contains("endpoint closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_has_no_timeout() {
        struct Slow;
        impl Endpoint<String, String> for Slow {
            fn name(&self) -> &str {
                "slow-secondary"
            }
            fn call(&self, request: String) -> BoxFuture<'_, String> {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(request)
                })
            }
        }

        let primary = Scripted::new("primary", Behaviour::Closed);
        let call: ResilientCall<String, String> =
            ResilientCall::new("test_actor", primary, Arc::new(Slow), Duration::from_millis(50));
        let answered = call.call("LOAN 1".to_string()).await.unwrap();
        assert_eq!(answered.response, "LOAN 1");
        assert_eq!(answered.served_by, ReplicaRole::Secondary);
    }
}
