// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic bus between the dispatcher and the return/renewal actor.
//!
//! Each subscriber owns a bounded `mpsc` queue; publishing routes a request
//! to every live subscriber of its topic and waits for queue space, up to the
//! publish timeout. A publication is either queued for every matching
//! subscriber or reported as failed, so nothing the dispatcher acknowledged
//! is dropped later.
//!
//! ```text
//! publish(RETURN) ──▶ [route: return_renewal_actor {RETURN, RENEWAL}] ──▶ mpsc(cap) ──▶ recv()
//!                 └─▶ [route: audit {RETURN}]                          ──▶ mpsc(cap) ──▶ recv()
//! ```

use crate::error::{MeshError, Result};
use crate::metrics;
use crate::protocol::Request;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

/// Publication topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Return,
    Renewal,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Return => "RETURN",
            Self::Renewal => "RENEWAL",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: Topic,
    pub request: Request,
}

#[derive(Debug)]
struct Route {
    name: String,
    topics: HashSet<Topic>,
    tx: mpsc::Sender<Publication>,
}

/// Publisher handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TopicBus {
    capacity: usize,
    publish_timeout: Duration,
    routes: Arc<RwLock<Vec<Route>>>,
}

impl TopicBus {
    /// `capacity` bounds each subscriber queue; `publish_timeout` bounds the wait for space.
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            publish_timeout,
            routes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Queue `request` for every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers it was queued for. Fails when there
    /// is no subscriber, or when a subscriber queue stays full past the
    /// publish timeout.
    pub async fn publish(&self, topic: Topic, request: Request) -> Result<usize> {
        let targets: Vec<(String, mpsc::Sender<Publication>)> = {
            let mut routes = self.routes.write().unwrap_or_else(|p| p.into_inner());
            routes.retain(|route| !route.tx.is_closed());
            routes
                .iter()
                .filter(|route| route.topics.contains(&topic))
                .map(|route| (route.name.clone(), route.tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            metrics::record_published(topic.as_str(), "no_subscriber");
            return Err(MeshError::transport(format!("bus/{}", topic), "no subscriber"));
        }

        let publication = Publication { topic, request };
        let mut delivered = 0;
        for (name, tx) in targets {
            match tx.send_timeout(publication.clone(), self.publish_timeout).await {
                Ok(()) => {
                    delivered += 1;
                    metrics::set_bus_depth(&name, tx.max_capacity() - tx.capacity());
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(topic = %topic, subscriber = %name, after = ?self.publish_timeout, "Subscriber queue full");
                    metrics::record_published(topic.as_str(), "full");
                    return Err(MeshError::Timeout {
                        endpoint: format!("bus/{}/{}", topic, name),
                        after: self.publish_timeout,
                    });
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(topic = %topic, subscriber = %name, "Subscriber went away");
                }
            }
        }

        if delivered == 0 {
            metrics::record_published(topic.as_str(), "no_subscriber");
            return Err(MeshError::transport(format!("bus/{}", topic), "no subscriber"));
        }
        metrics::record_published(topic.as_str(), "delivered");
        debug!(topic = %topic, delivered, "Published");
        Ok(delivered)
    }

    /// Subscribe to `topics`. Only publications made after this call are seen.
    pub fn subscribe(&self, name: impl Into<String>, topics: &[Topic]) -> Subscription {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Route {
                name: name.clone(),
                topics: topics.iter().copied().collect(),
                tx,
            });
        Subscription { name, rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|route| !route.tx.is_closed())
            .count()
    }
}

/// Receiving side of one subscriber queue.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    rx: mpsc::Receiver<Publication>,
}

impl Subscription {
    /// Next publication in publish order, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Publication> {
        self.rx.recv().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
