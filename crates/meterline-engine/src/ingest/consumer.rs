//! Decode, write, ack

use super::{Delivery, IngestEvent, Subscription};
use crate::metrics::EngineMetrics;
use crate::repository::RawEventRepository;
use chrono::Utc;
use meterline_common::{MeteringError, RequestContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pause after a transport error before polling again
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(250);

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Written and acked
    Written,
    /// Malformed; acked without a write
    Rejected,
    /// Write failed; left unacked for redelivery
    Failed,
}

/// Per-worker delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub written: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl IngestStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Written => self.written += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Write side of a worker, shared by reference across awaits
struct Sink {
    raw: Arc<dyn RawEventRepository>,
    metrics: Option<EngineMetrics>,
}

/// One ingestion worker
pub struct IngestConsumer<S> {
    worker: usize,
    subscription: S,
    sink: Sink,
}

impl<S: Subscription> IngestConsumer<S> {
    pub fn new(worker: usize, subscription: S, raw: Arc<dyn RawEventRepository>) -> Self {
        Self {
            worker,
            subscription,
            sink: Sink { raw, metrics: None },
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.sink.metrics = Some(metrics);
        self
    }

    /// Consume until the subscription closes or `shutdown` is cancelled
    #[instrument(skip(self, shutdown), fields(worker = self.worker))]
    pub async fn run(mut self, shutdown: CancellationToken) -> IngestStats {
        let mut stats = IngestStats::default();
        info!("Ingestion worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                next = self.subscription.next() => {
                    match next {
                        Ok(Some(delivery)) => stats.record(self.sink.handle(delivery).await),
                        Ok(None) => {
                            info!("Subscription closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Subscription error");
                            tokio::time::sleep(TRANSPORT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!(
            written = stats.written,
            rejected = stats.rejected,
            failed = stats.failed,
            "Ingestion worker stopped"
        );
        stats
    }

    /// Process one delivery and ack it unless the write failed
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        self.sink.handle(delivery).await
    }
}

impl Sink {
    async fn handle(&self, delivery: Delivery) -> Outcome {
        let started = Instant::now();
        let outcome = match self.write(&delivery.payload).await {
            Ok(()) => Outcome::Written,
            Err(e) if e.is_validation() || matches!(e, MeteringError::Serialization(_)) => {
                warn!(error = %e, "Rejected malformed event");
                Outcome::Rejected
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Failed to store event");
                Outcome::Failed
            }
        };

        if outcome != Outcome::Failed {
            if let Err(e) = delivery.ack().await {
                // The transport will redeliver; the write is idempotent by id
                warn!(error = %e, "Failed to ack delivery");
            }
        }

        if let Some(metrics) = &self.metrics {
            match outcome {
                Outcome::Written => metrics.events_ingested.inc(),
                Outcome::Rejected => metrics.events_rejected.inc(),
                Outcome::Failed => metrics.ingest_failures.inc(),
            }
            metrics
                .ingest_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let event = IngestEvent::decode(payload)?.into_raw_event(Utc::now())?;
        let ctx = RequestContext::new(event.tenant_id.clone(), event.environment_id.clone());
        self.raw.insert_event(&ctx, &event).await?;
        debug!(event_id = %event.id, event_name = %event.event_name, "Event stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ChannelSubscription;
    use crate::repository::InMemoryEventStore;
    use async_trait::async_trait;
    use meterline_common::{DatabaseError, FindRawEventsParams, KeysetCursor, RawEvent};

    fn doc(id: &str) -> String {
        format!(
            r#"{{"id":"{}","tenant_id":"tenant_1","environment_id":"env_1","external_customer_id":"cust_1","event_name":"api_call","timestamp":"2024-01-01T00:00:00Z"}}"#,
            id
        )
    }

    /// Store whose writes always fail
    struct DownStore;

    #[async_trait]
    impl RawEventRepository for DownStore {
        async fn insert_event(&self, _ctx: &RequestContext, _event: &RawEvent) -> Result<()> {
            Err(DatabaseError::insert("Failed to insert raw event", "connection refused").into())
        }

        async fn bulk_insert_events(&self, _ctx: &RequestContext, _events: &[RawEvent]) -> Result<()> {
            Err(DatabaseError::insert("Failed to bulk insert raw events", "connection refused").into())
        }

        async fn find_unprocessed_raw_events(
            &self,
            _ctx: &RequestContext,
            _params: &FindRawEventsParams,
        ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
            Ok((Vec::new(), None))
        }

        async fn find_raw_events(
            &self,
            _ctx: &RequestContext,
            _params: &FindRawEventsParams,
        ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
            Ok((Vec::new(), None))
        }
    }

    #[tokio::test]
    async fn test_valid_and_malformed_deliveries_are_acked() {
        let store = Arc::new(InMemoryEventStore::new());
        let (publisher, subscription) = ChannelSubscription::new(8);
        let metrics = EngineMetrics::new().unwrap();
        let consumer = IngestConsumer::new(0, subscription, store.clone()).with_metrics(metrics.clone());

        publisher.publish(doc("evt_1")).await.unwrap();
        publisher.publish(doc("evt_1")).await.unwrap();
        publisher.publish("{oops").await.unwrap();
        publisher
            .publish(r#"{"tenant_id":"tenant_1","environment_id":"env_1","external_customer_id":"","event_name":"api_call"}"#)
            .await
            .unwrap();
        let acks = publisher.ack_counter();
        drop(publisher);

        let stats = consumer.run(CancellationToken::new()).await;

        assert_eq!(stats, IngestStats { written: 2, rejected: 2, failed: 0 });
        assert_eq!(acks.get(), 4);
        assert_eq!(metrics.events_ingested.get(), 2);
        assert_eq!(metrics.events_rejected.get(), 2);

        // Two writes of one id are one logical event
        let ctx = RequestContext::new("tenant_1", "env_1");
        assert_eq!(store.raw_row_count(&ctx), 2);
        let (events, _) = store
            .find_unprocessed_raw_events(&ctx, &FindRawEventsParams::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_document_is_one_logical_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let (publisher, subscription) = ChannelSubscription::new(4);
        let no_timestamp = r#"{"id":"evt_2","tenant_id":"tenant_1","environment_id":"env_1","external_customer_id":"cust_1","event_name":"api_call"}"#;
        for payload in [doc("evt_1"), doc("evt_1"), no_timestamp.to_string(), no_timestamp.to_string()] {
            publisher.publish(payload).await.unwrap();
        }
        let acks = publisher.ack_counter();
        drop(publisher);

        let stats = IngestConsumer::new(0, subscription, store.clone())
            .run(CancellationToken::new())
            .await;
        assert_eq!(stats, IngestStats { written: 2, rejected: 2, failed: 0 });
        assert_eq!(acks.get(), 4);

        let ctx = RequestContext::new("tenant_1", "env_1");
        let (events, cursor) = store
            .find_unprocessed_raw_events(&ctx, &FindRawEventsParams::default())
            .await
            .unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["evt_1"]);
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_leaves_delivery_unacked() {
        let (publisher, mut subscription) = ChannelSubscription::new(2);
        publisher.publish(doc("evt_1")).await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();

        let consumer = IngestConsumer::new(0, subscription, Arc::new(DownStore));
        assert_eq!(consumer.handle(delivery).await, Outcome::Failed);
        assert_eq!(publisher.acked(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_worker() {
        let store = Arc::new(InMemoryEventStore::new());
        let (_publisher, subscription) = ChannelSubscription::new(1);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(IngestConsumer::new(0, subscription, store).run(shutdown.clone()));

        shutdown.cancel();
        let stats = worker.await.unwrap();
        assert_eq!(stats, IngestStats::default());
    }
}
