// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-facing entry point.
//!
//! Text comes in, text goes out. The request line is parsed once into a
//! typed [`Request`]; loans and availability checks go to the loan actor and
//! wait for its answer, returns and renewals are published on the topic bus
//! and acknowledged with `ACCEPTED <verb>` once queued for the actor. A bus
//! that cannot take the request answers `ERROR ...` instead.

use crate::bus::{Topic, TopicBus};
use crate::error::BoxFuture;
use crate::metrics::{MetricsSink, Stopwatch};
use crate::protocol::{Operation, Request, Response};
use crate::transport::Endpoint;
use std::sync::Arc;
use tracing::debug;

pub struct Dispatcher {
    loan_actor: Arc<dyn Endpoint<Request, Response>>,
    bus: TopicBus,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub const COMPONENT: &'static str = "dispatcher";

    pub fn new(loan_actor: Arc<dyn Endpoint<Request, Response>>, bus: TopicBus, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            loan_actor,
            bus,
            metrics,
        }
    }

    /// Handle one raw request line and return the response token.
    pub async fn handle(&self, raw: &str) -> String {
        self.dispatch(raw).await.to_string()
    }

    /// Typed variant of [`Dispatcher::handle`].
    pub async fn dispatch(&self, raw: &str) -> Response {
        let request = match raw.parse::<Request>() {
            Ok(request) => request,
            Err(e) => {
                let response = Response::error(&e);
                self.metrics
                    .record(Stopwatch::start(Self::COMPONENT, "INVALID").finish(false, format!("{:?} -> {}", raw, response)));
                return response;
            }
        };

        let watch = Stopwatch::start(Self::COMPONENT, request.operation.as_str());
        let response = self.route(request.clone()).await;
        debug!(request = %request, response = %response, "Dispatched");
        self.metrics
            .record(watch.finish(response.is_success(), format!("{} -> {}", request, response)));
        response
    }

    async fn route(&self, request: Request) -> Response {
        match request.operation {
            Operation::Loan | Operation::Availability => match self.loan_actor.call(request).await {
                Ok(response) => response,
                Err(e) => Response::error(&e),
            },
            Operation::Return => self.publish(Topic::Return, request).await,
            Operation::Renew => self.publish(Topic::Renewal, request).await,
        }
    }

    /// `ACCEPTED` only once the request is queued for the actor.
    async fn publish(&self, topic: Topic, request: Request) -> Response {
        let operation = request.operation;
        match self.bus.publish(topic, request).await {
            Ok(_) => Response::Accepted { operation },
            Err(e) => Response::error(&e),
        }
    }
}

impl Endpoint<String, String> for Dispatcher {
    fn name(&self) -> &str {
        Self::COMPONENT
    }

    fn call(&self, request: String) -> BoxFuture<'_, String> {
        Box::pin(async move { Ok(self.handle(&request).await) })
    }
}
