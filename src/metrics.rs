// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Two layers:
//!
//! - **Call samples** go through an explicit [`MetricsSink`] handed to each
//!   component at bootstrap. Every dispatcher, actor and replica call produces
//!   one [`Sample`] (component, operation, start, end, success, detail).
//! - **Process gauges/counters** (pending log depth, fallbacks, reconcile
//!   rounds, store retries) go straight to the `metrics` facade through the
//!   helper functions at the bottom of this module.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `circulation_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use circulation_mesh::metrics::{MemorySink, MetricsSink, Stopwatch};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(MemorySink::new());
//! let watch = Stopwatch::start("dispatcher", "LOAN");
//! // ... handle the request ...
//! sink.record(watch.finish(true, "GRANTED due=2026-10-28"));
//! println!("{}", sink.report());
//! ```

use metrics::{counter, gauge, histogram};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One timed call.
#[derive(Debug, Clone)]
pub struct Sample {
    pub component: String,
    pub operation: String,
    pub start: Instant,
    pub end: Instant,
    pub success: bool,
    pub detail: String,
}

impl Sample {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Destination for call samples.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, sample: Sample);
}

/// Measures one call from construction to [`Stopwatch::finish`].
#[derive(Debug)]
pub struct Stopwatch {
    component: String,
    operation: String,
    start: Instant,
}

impl Stopwatch {
    pub fn start(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    pub fn finish(self, success: bool, detail: impl Into<String>) -> Sample {
        Sample {
            component: self.component,
            operation: self.operation,
            start: self.start,
            end: Instant::now(),
            success,
            detail: detail.into(),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl MetricsSink for NoOpSink {
    fn record(&self, _sample: Sample) {}
}

/// Forwards samples to the installed `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn record(&self, sample: Sample) {
        let status = if sample.success { "success" } else { "failure" };
        let secs = sample.duration().as_secs_f64();
        counter!(
            "circulation_calls_total",
            "component" => sample.component.clone(),
            "operation" => sample.operation.clone(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "circulation_call_duration_seconds",
            "component" => sample.component,
            "operation" => sample.operation
        )
        .record(secs);
    }
}

/// Keeps every sample for a summary report.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_samples(&self.lock())
    }

    /// Human-readable report: totals, per-component, per-operation, then each sample.
    pub fn report(&self) -> String {
        let samples = self.samples();
        if samples.is_empty() {
            return "No samples recorded.\n".to_string();
        }
        let summary = MetricsSummary::from_samples(&samples);
        let mut out = String::new();

        let _ = writeln!(out, "=== CIRCULATION METRICS ===");
        let _ = writeln!(out, "Total calls: {}", summary.total);
        let _ = writeln!(out, "Succeeded: {}", summary.succeeded);
        let _ = writeln!(out, "Failed: {}", summary.failed);
        let _ = writeln!(out, "Success rate: {:.2}%", summary.success_rate());

        let _ = writeln!(out, "\n--- BY COMPONENT ---");
        for (component, stats) in &summary.by_component {
            let _ = writeln!(out, "{}: {}", component, stats);
        }
        let _ = writeln!(out, "\n--- BY OPERATION ---");
        for (operation, stats) in &summary.by_operation {
            let _ = writeln!(out, "{}: {}", operation, stats);
        }

        let _ = writeln!(out, "\n--- SAMPLES ---");
        let _ = writeln!(out, "component | operation | ms | ok | detail");
        for s in &samples {
            let _ = writeln!(
                out,
                "{} | {} | {:.2} | {} | {}",
                s.component,
                s.operation,
                s.duration().as_secs_f64() * 1000.0,
                if s.success { "yes" } else { "no" },
                s.detail
            );
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, sample: Sample) {
        self.lock().push(sample);
    }
}

/// Duration statistics for one group of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub count: usize,
    pub succeeded: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
}

impl GroupStats {
    fn from_durations(samples: &[&Sample]) -> Self {
        let durations: Vec<Duration> = samples.iter().map(|s| s.duration()).collect();
        let total: Duration = durations.iter().sum();
        Self {
            count: samples.len(),
            succeeded: samples.iter().filter(|s| s.success).count(),
            min: durations.iter().min().copied().unwrap_or_default(),
            max: durations.iter().max().copied().unwrap_or_default(),
            mean: total / (samples.len().max(1) as u32),
        }
    }
}

impl std::fmt::Display for GroupStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean={:.2} ms, min={:.2} ms, max={:.2} ms, ok={}/{}",
            self.mean.as_secs_f64() * 1000.0,
            self.min.as_secs_f64() * 1000.0,
            self.max.as_secs_f64() * 1000.0,
            self.succeeded,
            self.count
        )
    }
}

/// Aggregate view over a set of samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub by_component: BTreeMap<String, GroupStats>,
    pub by_operation: BTreeMap<String, GroupStats>,
}

impl MetricsSummary {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut components: BTreeMap<String, Vec<&Sample>> = BTreeMap::new();
        let mut operations: BTreeMap<String, Vec<&Sample>> = BTreeMap::new();
        for s in samples {
            components.entry(s.component.clone()).or_default().push(s);
            operations.entry(s.operation.clone()).or_default().push(s);
        }
        let succeeded = samples.iter().filter(|s| s.success).count();
        Self {
            total: samples.len(),
            succeeded,
            failed: samples.len() - succeeded,
            by_component: components
                .into_iter()
                .map(|(k, v)| (k, GroupStats::from_durations(&v)))
                .collect(),
            by_operation: operations
                .into_iter()
                .map(|(k, v)| (k, GroupStats::from_durations(&v)))
                .collect(),
        }
    }

    /// Percentage of successful samples (0.0 when empty).
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.total as f64
    }
}

// =============================================================================
// Process Metrics
// =============================================================================

/// Gauge for a replica's unacknowledged change count.
pub fn set_pending_depth(replica: &str, depth: usize) {
    gauge!("circulation_pending_changes", "replica" => replica.to_string()).set(depth as f64);
}

/// Record an actor call that left the primary.
///
/// `outcome` is `secondary` when the fallback answered, `unavailable` when it did not.
pub fn record_fallback(component: &str, reason: &str, outcome: &str) {
    counter!(
        "circulation_fallbacks_total",
        "component" => component.to_string(),
        "reason" => reason.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one push notification to the peer.
pub fn record_notify(replica: &str, outcome: &str) {
    counter!(
        "circulation_peer_notifications_total",
        "replica" => replica.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one pull/ack round run by `replica` as requester.
pub fn record_reconcile_round(replica: &str, applied: usize, acked: usize, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "circulation_reconcile_rounds_total",
        "replica" => replica.to_string(),
        "status" => status
    )
    .increment(1);
    counter!("circulation_reconcile_applied_total", "replica" => replica.to_string()).increment(applied as u64);
    counter!("circulation_reconcile_acked_total", "replica" => replica.to_string()).increment(acked as u64);
    histogram!("circulation_reconcile_duration_seconds", "replica" => replica.to_string())
        .record(duration.as_secs_f64());
}

/// Record a publication on the topic bus (`delivered`, `no_subscriber`, `full`).
pub fn record_published(topic: &str, status: &str) {
    counter!(
        "circulation_bus_publications_total",
        "topic" => topic.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Gauge for publications queued but not yet taken by a subscriber.
pub fn set_bus_depth(subscriber: &str, depth: usize) {
    gauge!("circulation_bus_queue_depth", "subscriber" => subscriber.to_string()).set(depth as f64);
}

/// Record store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("circulation_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for mesh lifecycle state.
pub fn set_mesh_state(state: &str) {
    // 0=created, 1=starting, 2=running, 3=shutting down, 4=stopped, 5=failed
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("circulation_mesh_state").set(value);
}
