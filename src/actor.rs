// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation actors: stateless forwarders from the dispatcher to the replicas.
//!
//! - [`LoanActor`] answers synchronously on its own request channel.
//! - [`ReturnRenewalActor`] consumes `RETURN`/`RENEWAL` publications from the
//!   topic bus one at a time and reports each outcome out of band as a
//!   [`Completion`].
//!
//! Both resolve faults into `ERROR ...` responses, so callers always get a
//! response token back.

use crate::bus::Subscription;
use crate::error::{BoxFuture, MeshError};
use crate::metrics::{MetricsSink, Stopwatch};
use crate::model::ReplicaRole;
use crate::protocol::{Request, Response};
use crate::resilience::ResilientCall;
use crate::transport::Endpoint;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, info_span, warn, Instrument};

/// Capacity of the completion broadcast.
const COMPLETION_CAPACITY: usize = 256;

/// Outcome of one asynchronously processed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: Request,
    pub response: Response,
    /// `None` when neither replica answered.
    pub served_by: Option<ReplicaRole>,
}

async fn forward(
    component: &str,
    call: &ResilientCall<Request, Response>,
    metrics: &dyn MetricsSink,
    request: Request,
) -> (Response, Option<ReplicaRole>) {
    let watch = Stopwatch::start(component, request.operation.as_str());
    let (response, served_by) = match call.call(request.clone()).await {
        Ok(answered) => (answered.response, Some(answered.served_by)),
        Err(e) => (Response::error(&e), None),
    };
    let detail = match served_by {
        Some(role) => format!("{} -> {} (served_by={})", request, response, role),
        None => format!("{} -> {}", request, response),
    };
    metrics.record(watch.finish(response.is_success(), detail));
    (response, served_by)
}

/// Forwards loan and availability requests.
pub struct LoanActor {
    call: ResilientCall<Request, Response>,
    metrics: Arc<dyn MetricsSink>,
}

impl LoanActor {
    pub const COMPONENT: &'static str = "loan_actor";

    pub fn new(call: ResilientCall<Request, Response>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { call, metrics }
    }

    pub async fn handle(&self, request: Request) -> Response {
        forward(Self::COMPONENT, &self.call, self.metrics.as_ref(), request).await.0
    }
}

impl Endpoint<Request, Response> for LoanActor {
    fn name(&self) -> &str {
        Self::COMPONENT
    }

    fn call(&self, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(async move { Ok(self.handle(request).await) })
    }
}

/// Processes return and renewal publications.
pub struct ReturnRenewalActor {
    call: ResilientCall<Request, Response>,
    metrics: Arc<dyn MetricsSink>,
    completions: broadcast::Sender<Completion>,
}

impl ReturnRenewalActor {
    pub const COMPONENT: &'static str = "return_renewal_actor";

    pub fn new(call: ResilientCall<Request, Response>, metrics: Arc<dyn MetricsSink>) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        Self {
            call,
            metrics,
            completions,
        }
    }

    /// Observe outcomes processed after this call.
    pub fn completions(&self) -> broadcast::Receiver<Completion> {
        self.completions.subscribe()
    }

    /// Process one request and broadcast its completion.
    pub async fn process(&self, request: Request) -> Completion {
        let (response, served_by) = forward(Self::COMPONENT, &self.call, self.metrics.as_ref(), request.clone()).await;
        if response.is_error() {
            warn!(request = %request, response = %response, "Out-of-band request failed");
        } else {
            info!(request = %request, response = %response, served_by = ?served_by, "Out-of-band request processed");
        }
        let completion = Completion {
            request,
            response,
            served_by,
        };
        // No observers is fine.
        let _ = self.completions.send(completion.clone());
        completion
    }

    /// Consume publications sequentially until shutdown or the bus closes.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) -> Result<(), MeshError> {
        let span = info_span!("return_renewal_actor", subscriber = %subscription.name());
        async move {
            info!("Return/renewal actor started");
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    publication = subscription.recv() => {
                        let Some(publication) = publication else {
                            warn!("Topic bus closed");
                            break;
                        };
                        self.process(publication.request).await;
                    }
                }
            }
            info!("Return/renewal actor stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
