// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic reconciliation.
//!
//! Every tick each reachable replica pulls its peer's pending changes and
//! acks what it applied. Push notifications usually leave nothing to do; the
//! loop is what catches up a replica that was unreachable when a change was
//! made. A failed round is logged and retried on the next tick.

use crate::config::ReconcileConfig;
use crate::replica::{ReconcileReport, Replica};
use crate::transport::LinkSwitch;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, Instrument};

/// A replica and the switch saying whether its process is up.
#[derive(Clone)]
pub(crate) struct Member {
    pub replica: Arc<Replica>,
    pub switch: LinkSwitch,
}

/// One round on every reachable member. Returns `(name, report)` per member
/// that completed.
pub(crate) async fn run_round(members: &[Member]) -> Vec<(String, ReconcileReport)> {
    let mut reports = Vec::with_capacity(members.len());
    for member in members {
        let name = member.replica.name().to_string();
        if member.switch.is_down() {
            debug!(replica = %name, "Skipping reconcile, replica stopped");
            continue;
        }
        match member.replica.reconcile().await {
            Ok(report) => reports.push((name, report)),
            Err(e) => debug!(replica = %name, error = %e, "Retrying reconcile next tick"),
        }
    }
    reports
}

/// Run the periodic loop until shutdown is signalled.
pub(crate) async fn run_reconcile_loop(members: Vec<Member>, config: ReconcileConfig, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("reconcile_loop");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let interval = config.interval();
        info!(interval_secs = interval.as_secs(), "Starting periodic reconciliation");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately; startup has nothing to reconcile yet.
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconciliation");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            for (name, report) in run_round(&members).await {
                if !report.is_noop() {
                    debug!(replica = %name, ?report, "Periodic reconcile round");
                }
            }
        }
    }
    .instrument(span)
    .await
}
