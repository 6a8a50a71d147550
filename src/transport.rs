// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request/response channels between mesh processes.
//!
//! Every component talks to its neighbours through an [`Endpoint`] and never
//! holds a direct reference to the process behind it. The concrete transport
//! is an in-process bounded `mpsc` queue carrying an [`Envelope`] with a
//! `oneshot` reply slot:
//!
//! ```text
//! caller ──Envelope{request, reply}──▶ inbox ──▶ serve() ──spawn──▶ handler.call()
//!    ▲                                                                   │
//!    └──────────────────────────── reply (oneshot) ◀────────────────────┘
//! ```
//!
//! A closed inbox, a dropped reply slot or a severed [`LinkSwitch`] surfaces
//! as [`MeshError::Transport`], which operation actors treat as "unreachable".

use crate::error::{BoxFuture, MeshError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

/// Something that answers requests.
pub trait Endpoint<Req, Rep>: Send + Sync {
    /// Name used in errors and log fields.
    fn name(&self) -> &str;

    fn call(&self, request: Req) -> BoxFuture<'_, Rep>;
}

/// One in-flight request and the slot its answer goes to.
pub struct Envelope<Req, Rep> {
    pub request: Req,
    pub reply: oneshot::Sender<Result<Rep>>,
}

/// Receiving half of a channel endpoint.
pub type Inbox<Req, Rep> = mpsc::Receiver<Envelope<Req, Rep>>;

/// Client half of an in-process request channel.
pub struct ChannelEndpoint<Req, Rep> {
    name: String,
    tx: mpsc::Sender<Envelope<Req, Rep>>,
}

impl<Req, Rep> Clone for ChannelEndpoint<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Rep> ChannelEndpoint<Req, Rep> {
    /// True once the serving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<Req, Rep> Endpoint<Req, Rep> for ChannelEndpoint<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, request: Req) -> BoxFuture<'_, Rep> {
        Box::pin(async move {
            let (reply, answer) = oneshot::channel();
            self.tx
                .send(Envelope { request, reply })
                .await
                .map_err(|_| MeshError::transport(&self.name, "endpoint closed"))?;
            answer
                .await
                .map_err(|_| MeshError::transport(&self.name, "reply dropped"))?
        })
    }
}

/// Create a bounded request channel.
pub fn channel<Req, Rep>(name: impl Into<String>, capacity: usize) -> (ChannelEndpoint<Req, Rep>, Inbox<Req, Rep>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelEndpoint { name: name.into(), tx }, rx)
}

/// Shared up/down flag for every link into one process.
#[derive(Debug, Clone, Default)]
pub struct LinkSwitch {
    down: Arc<AtomicBool>,
}

impl LinkSwitch {
    pub fn sever(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

/// An endpoint that fails with `link down` while its switch is severed.
pub struct Switched<E> {
    inner: E,
    switch: LinkSwitch,
}

impl<E> Switched<E> {
    pub fn new(inner: E, switch: LinkSwitch) -> Self {
        Self { inner, switch }
    }
}

impl<Req, Rep, E> Endpoint<Req, Rep> for Switched<E>
where
    Req: Send + 'static,
    Rep: Send + 'static,
    E: Endpoint<Req, Rep>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn call(&self, request: Req) -> BoxFuture<'_, Rep> {
        if self.switch.is_down() {
            let name = self.inner.name().to_string();
            return Box::pin(async move { Err(MeshError::transport(name, "link down")) });
        }
        self.inner.call(request)
    }
}

/// Serve an inbox with `handler`, one task per request, until shutdown.
///
/// When the returned task ends (shutdown or abort) the inbox is dropped and
/// callers see `endpoint closed`. Requests already handed to a task still
/// get their answer.
pub fn serve<Req, Rep, H>(
    mut inbox: Inbox<Req, Rep>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    Req: Send + 'static,
    Rep: Send + 'static,
    H: Endpoint<Req, Rep> + ?Sized + 'static,
{
    let span = info_span!("listener", endpoint = %handler.name());
    tokio::spawn(
        async move {
            debug!("Listener started");
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    envelope = inbox.recv() => {
                        let Some(Envelope { request, reply }) = envelope else {
                            break;
                        };
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let answer = handler.call(request).await;
                            // Caller may have timed out and dropped the slot.
                            let _ = reply.send(answer);
                        });
                    }
                }
            }
            debug!("Listener stopped");
        }
        .instrument(span),
    )
}
