//! Prometheus metrics for ingestion and processing

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Engine counters and latencies
#[derive(Clone)]
pub struct EngineMetrics {
    pub events_ingested: IntCounter,
    /// Deliveries that could not be decoded or validated
    pub events_rejected: IntCounter,
    /// Deliveries left unacked after a store failure
    pub ingest_failures: IntCounter,
    pub ingest_duration_seconds: Histogram,
    /// Processed rows written, by status
    pub events_processed: IntCounterVec,
    /// Raw events with no meter binding
    pub events_skipped: IntCounter,
    pub discovery_batches: IntCounter,
    pub processing_duration_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            events_ingested: IntCounter::new(
                "meterline_events_ingested_total",
                "Raw events written by the ingestion consumer",
            )?,
            events_rejected: IntCounter::new(
                "meterline_events_rejected_total",
                "Deliveries acked without a write because they were malformed",
            )?,
            ingest_failures: IntCounter::new(
                "meterline_ingest_failures_total",
                "Deliveries left for redelivery after a store failure",
            )?,
            ingest_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "meterline_ingest_duration_seconds",
                    "Decode and write time per delivery",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            )?,
            events_processed: IntCounterVec::new(
                Opts::new(
                    "meterline_events_processed_total",
                    "Processed rows written by the usage processor",
                ),
                &["status"],
            )?,
            events_skipped: IntCounter::new(
                "meterline_events_skipped_total",
                "Raw events without a matching meter binding",
            )?,
            discovery_batches: IntCounter::new(
                "meterline_discovery_batches_total",
                "Unprocessed-event pages fetched",
            )?,
            processing_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "meterline_processing_duration_seconds",
                    "Time to process one window",
                )
                .buckets(prometheus::exponential_buckets(0.01, 4.0, 8)?),
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.events_ingested.clone()))?;
        registry.register(Box::new(self.events_rejected.clone()))?;
        registry.register(Box::new(self.ingest_failures.clone()))?;
        registry.register(Box::new(self.ingest_duration_seconds.clone()))?;
        registry.register(Box::new(self.events_processed.clone()))?;
        registry.register(Box::new(self.events_skipped.clone()))?;
        registry.register(Box::new(self.discovery_batches.clone()))?;
        registry.register(Box::new(self.processing_duration_seconds.clone()))?;
        Ok(())
    }
}
