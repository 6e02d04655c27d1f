//! Prometheus metrics for one pipeline instance.
//!
//! Every `PipelineMetrics` owns its own `prometheus::Registry`, so several
//! pipelines (or tests) can run in one process without sharing counters.
//! Cloning shares the underlying metrics.

use crate::error::TelemetryResult;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tw_core::LifecycleCounters;

#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    batches_applied: IntCounter,
    batches_rejected: IntCounterVec,
    transitions: IntCounterVec,
    source_errors: IntCounter,
    verifications: IntCounter,
    stage_rebuilds: IntCounterVec,
    listings: IntGaugeVec,
    sources: IntGauge,
    busy_sources: IntGauge,
    apply_seconds: HistogramVec,
}

impl PipelineMetrics {
    pub fn new() -> TelemetryResult<Self> {
        let registry = Registry::new();

        let batches_applied = IntCounter::with_opts(Opts::new(
            "tradewatch_batches_applied_total",
            "Listing batches applied",
        ))?;
        let batches_rejected = IntCounterVec::new(
            Opts::new(
                "tradewatch_batches_rejected_total",
                "Listing batches rejected",
            ),
            &["reason"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new(
                "tradewatch_transitions_total",
                "Lifecycle transitions applied",
            ),
            &["kind"],
        )?;
        let source_errors = IntCounter::with_opts(Opts::new(
            "tradewatch_source_errors_total",
            "Errors reported by sources",
        ))?;
        let verifications = IntCounter::with_opts(Opts::new(
            "tradewatch_verification_required_total",
            "Verification-required signals forwarded",
        ))?;
        let stage_rebuilds = IntCounterVec::new(
            Opts::new("tradewatch_stage_rebuilds_total", "View stage recomputations"),
            &["stage"],
        )?;
        let listings = IntGaugeVec::new(
            Opts::new("tradewatch_listings", "Merged listings by lifecycle state"),
            &["state"],
        )?;
        let sources = IntGauge::with_opts(Opts::new(
            "tradewatch_sources",
            "Registered sources (groups included)",
        ))?;
        let busy_sources = IntGauge::with_opts(Opts::new(
            "tradewatch_busy_sources",
            "Sources currently refreshing",
        ))?;
        let apply_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tradewatch_batch_apply_seconds",
                "Batch classification and apply latency",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["mode"],
        )?;

        registry.register(Box::new(batches_applied.clone()))?;
        registry.register(Box::new(batches_rejected.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(verifications.clone()))?;
        registry.register(Box::new(stage_rebuilds.clone()))?;
        registry.register(Box::new(listings.clone()))?;
        registry.register(Box::new(sources.clone()))?;
        registry.register(Box::new(busy_sources.clone()))?;
        registry.register(Box::new(apply_seconds.clone()))?;

        Ok(Self {
            registry,
            batches_applied,
            batches_rejected,
            transitions,
            source_errors,
            verifications,
            stage_rebuilds,
            listings,
            sources,
            busy_sources,
            apply_seconds,
        })
    }

    // ========================================================================
    // Batches
    // ========================================================================

    pub fn batch_applied(&self) {
        self.batches_applied.inc();
    }

    /// Record a rejected batch (`protocol_violation`, `desync`, `faulted`).
    pub fn batch_rejected(&self, reason: &str) {
        self.batches_rejected.with_label_values(&[reason]).inc();
    }

    /// Record `count` transitions of `kind` (`created`, `reappeared`, `removed`, `read`).
    pub fn transitions(&self, kind: &str, count: usize) {
        if count > 0 {
            self.transitions
                .with_label_values(&[kind])
                .inc_by(count as u64);
        }
    }

    /// Record apply latency; `mode` is `inline` or `blocking`.
    pub fn observe_apply(&self, mode: &str, seconds: f64) {
        self.apply_seconds.with_label_values(&[mode]).observe(seconds);
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub fn source_error(&self) {
        self.source_errors.inc();
    }

    pub fn verification_required(&self) {
        self.verifications.inc();
    }

    pub fn set_sources(&self, count: usize) {
        self.sources.set(count as i64);
    }

    pub fn set_busy_sources(&self, count: usize) {
        self.busy_sources.set(count as i64);
    }

    // ========================================================================
    // View
    // ========================================================================

    /// Record a recomputation of `stage` (`filter`, `sort`, `page`).
    pub fn stage_rebuilt(&self, stage: &str) {
        self.stage_rebuilds.with_label_values(&[stage]).inc();
    }

    pub fn set_listings(&self, counters: LifecycleCounters) {
        self.listings
            .with_label_values(&["new"])
            .set(counters.new_count as i64);
        self.listings
            .with_label_values(&["removed"])
            .set(counters.removed_count as i64);
        self.listings
            .with_label_values(&["normal"])
            .set(counters.normal_count as i64);
    }

    /// Render every metric in the Prometheus text format.
    pub fn gather_text(&self) -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("batches_applied", &self.batches_applied.get())
            .field("sources", &self.sources.get())
            .finish()
    }
}
