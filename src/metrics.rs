use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RebuildLabels {
    pub outcome: RebuildOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RebuildOutcome {
    Success,
    Empty,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    pub reason: RejectReason,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RejectReason {
    NotReady,
    Empty,
    UserAgent,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the reseeder.
pub struct Metrics {
    // -- rebuilds --
    pub rebuild_total: Family<RebuildLabels, Counter>,
    pub rebuild_skipped_total: Counter,
    pub rebuild_duration_seconds: Histogram,

    // -- live generation --
    pub generation_id: Gauge,
    pub generation_bundles: Gauge,
    pub generation_source_records: Gauge,

    // -- serving --
    pub bundles_served_total: Counter,
    pub bundle_bytes_served_total: Counter,
    pub requests_rejected_total: Family<RejectLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let rebuild_total = Family::<RebuildLabels, Counter>::default();
        registry.register(
            "reseed_rebuild",
            "Cache rebuilds by outcome",
            rebuild_total.clone(),
        );

        let rebuild_skipped_total = Counter::default();
        registry.register(
            "reseed_rebuild_skipped",
            "Rebuild ticks dropped because a build was still running",
            rebuild_skipped_total.clone(),
        );

        let rebuild_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "reseed_rebuild_duration_seconds",
            "Wall time of a full rebuild",
            rebuild_duration_seconds.clone(),
        );

        let generation_id: Gauge = Gauge::default();
        registry.register(
            "reseed_generation_id",
            "Id of the live bundle generation",
            generation_id.clone(),
        );

        let generation_bundles: Gauge = Gauge::default();
        registry.register(
            "reseed_generation_bundles",
            "su3 files in the live generation",
            generation_bundles.clone(),
        );

        let generation_source_records: Gauge = Gauge::default();
        registry.register(
            "reseed_generation_source_records",
            "Router infos available when the live generation was built",
            generation_source_records.clone(),
        );

        let bundles_served_total = Counter::default();
        registry.register(
            "reseed_bundles_served",
            "su3 files handed to clients",
            bundles_served_total.clone(),
        );

        let bundle_bytes_served_total = Counter::default();
        registry.register(
            "reseed_bundle_bytes_served",
            "su3 bytes handed to clients",
            bundle_bytes_served_total.clone(),
        );

        let requests_rejected_total = Family::<RejectLabels, Counter>::default();
        registry.register(
            "reseed_requests_rejected",
            "Reseed requests refused, by reason",
            requests_rejected_total.clone(),
        );

        Self {
            rebuild_total,
            rebuild_skipped_total,
            rebuild_duration_seconds,
            generation_id,
            generation_bundles,
            generation_source_records,
            bundles_served_total,
            bundle_bytes_served_total,
            requests_rejected_total,
        }
    }

    pub fn record_rebuild(&self, outcome: RebuildOutcome) {
        self.rebuild_total
            .get_or_create(&RebuildLabels { outcome })
            .inc();
    }

    pub fn record_reject(&self, reason: RejectReason) {
        self.requests_rejected_total
            .get_or_create(&RejectLabels { reason })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle on the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
