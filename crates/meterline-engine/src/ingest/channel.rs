//! In-process transport over a tokio channel

use super::{Acker, Delivery, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use meterline_common::{MeteringError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half; counts acks made by the consumer
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Bytes>,
    acked: Arc<AtomicUsize>,
}

impl ChannelPublisher {
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| MeteringError::Network("ingest channel closed".into()))
    }

    /// Deliveries acknowledged so far
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::Acquire)
    }

    /// Ack count that outlives the publisher
    pub fn ack_counter(&self) -> AckCounter {
        AckCounter(self.acked.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AckCounter(Arc<AtomicUsize>);

impl AckCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Receiving half. Unacked deliveries are dropped; there is no redelivery
pub struct ChannelSubscription {
    rx: mpsc::Receiver<Bytes>,
    acked: Arc<AtomicUsize>,
}

impl ChannelSubscription {
    pub fn new(buffer: usize) -> (ChannelPublisher, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        let acked = Arc::new(AtomicUsize::new(0));
        (
            ChannelPublisher {
                tx,
                acked: acked.clone(),
            },
            Self { rx, acked },
        )
    }
}

struct CountingAcker(Arc<AtomicUsize>);

#[async_trait]
impl Acker for CountingAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        Ok(self.rx.recv().await.map(|payload| {
            Delivery::new(payload, Box::new(CountingAcker(self.acked.clone())))
        }))
    }
}
