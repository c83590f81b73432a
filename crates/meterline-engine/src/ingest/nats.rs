//! NATS JetStream transport
//!
//! Each worker binds the same durable pull consumer, so JetStream spreads
//! messages across workers and redelivers anything left unacked.

use super::{Acker, Delivery, Subscription};
use crate::config::NatsSettings;
use async_nats::jetstream::{self, consumer::pull};
use async_trait::async_trait;
use futures::StreamExt;
use meterline_common::{MeteringError, Result};
use tracing::{info, instrument};

pub struct NatsSubscription {
    messages: pull::Stream,
}

impl NatsSubscription {
    /// Connect and bind the durable consumer described by `settings`
    #[instrument(skip(settings), fields(url = %settings.url, stream = %settings.stream))]
    pub async fn connect(settings: &NatsSettings) -> Result<Self> {
        let client = async_nats::connect(settings.url.as_str())
            .await
            .map_err(|e| MeteringError::Network(format!("Failed to connect to NATS: {}", e)))?;
        Self::bind(jetstream::new(client), settings).await
    }

    pub async fn bind(context: jetstream::Context, settings: &NatsSettings) -> Result<Self> {
        let stream = context.get_stream(settings.stream.as_str()).await.map_err(|e| {
            MeteringError::Network(format!("Failed to get stream {}: {}", settings.stream, e))
        })?;
        let consumer = stream
            .get_or_create_consumer(
                settings.durable_name.as_str(),
                pull::Config {
                    durable_name: Some(settings.durable_name.clone()),
                    filter_subject: settings.subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                MeteringError::Network(format!(
                    "Failed to bind consumer {}: {}",
                    settings.durable_name, e
                ))
            })?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| MeteringError::Network(format!("Failed to open message stream: {}", e)))?;

        info!(subject = %settings.subject, durable = %settings.durable_name, "NATS subscription bound");
        Ok(Self { messages })
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| MeteringError::Network(format!("Failed to ack message: {}", e)))
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            Some(Ok(message)) => {
                let payload = message.payload.clone();
                Ok(Some(Delivery::new(payload, Box::new(JetStreamAcker(message)))))
            }
            Some(Err(e)) => Err(MeteringError::Network(format!("NATS delivery failed: {}", e))),
            None => Ok(None),
        }
    }
}
