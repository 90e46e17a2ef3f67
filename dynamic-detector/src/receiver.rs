//! The alert receiver: an ephemeral fan-out subscription on the broker.
//!
//! Each instance binds its own non-persistent queue to the alert exchange,
//! so every replica sees every alert and queues disappear with the pod.
//! Parsed alerts go out over a bounded channel; a fatal transport failure
//! puts a single sentinel on the error channel, which the event loop
//! treats as reason to bring the whole process down.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alert::Alert;
use crate::config::DetectorConfig;
use crate::metrics::Metrics;

/// In-flight window on the alert subscription. Can be high, as long as the
/// broker and this process have memory for it.
const PREFETCH: u16 = 500;

/// Alert channel depth.
const ALERT_BUFFER: usize = 100;

/// Fatal receiver failure, delivered once over the error channel.
#[derive(Debug, thiserror::Error)]
#[error("alert receiver quit unexpectedly: {reason}")]
pub struct ReceiverError {
    pub reason: String,
}

/// Subscribe to the alert exchange and spawn the consume task.
///
/// Alerts arrive on the first channel. The second carries at most one
/// [`ReceiverError`]; any value on it is fatal.
pub fn register_for_alerts(
    token: CancellationToken,
    config: &DetectorConfig,
    metrics: Arc<Metrics>,
) -> (mpsc::Receiver<Alert>, mpsc::Receiver<ReceiverError>) {
    let (alerts_tx, alerts_rx) = mpsc::channel(ALERT_BUFFER);
    let (errors_tx, errors_rx) = mpsc::channel(1);

    let receiver = AlertReceiver {
        broker: config.broker.clone(),
        exchange: config.alert_exchange.clone(),
        queue: instance_queue_name(),
        metrics,
    };
    tokio::spawn(async move {
        if let Err(e) = receiver.consume(token, alerts_tx).await {
            tracing::error!("error reading from alert queue: {e:#}");
            let _ = errors_tx.try_send(ReceiverError {
                reason: format!("{e:#}"),
            });
        }
    });

    (alerts_rx, errors_rx)
}

/// Per-instance queue name, random when the hostname lookup fails.
fn instance_queue_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    format!("alert-receiver.{host}")
}

struct AlertReceiver {
    broker: String,
    exchange: String,
    queue: String,
    metrics: Arc<Metrics>,
}

impl AlertReceiver {
    async fn consume(
        &self,
        token: CancellationToken,
        alerts_tx: mpsc::Sender<Alert>,
    ) -> Result<()> {
        let conn = Connection::connect(&self.broker, ConnectionProperties::default())
            .await
            .context("connecting to broker")?;
        let channel = conn.create_channel().await.context("opening channel")?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .context("setting prefetch")?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("declaring alert exchange")?;

        // Non-persistent: the queue only exists for the life of this
        // instance.
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("declaring alert queue")?;
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("binding alert queue")?;

        let mut consumer = channel
            .basic_consume(
                &self.queue,
                "alert-receiver",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("starting alert consumer")?;
        tracing::info!(exchange = %self.exchange, queue = %self.queue, "subscribed for alerts");

        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("alert receiver shutting down");
                    return Ok(());
                }
                delivery = consumer.next() => delivery,
            };
            let Some(delivery) = delivery else {
                anyhow::bail!("alert consumer stream closed");
            };
            let delivery = delivery.context("receiving alert delivery")?;
            delivery
                .ack(BasicAckOptions::default())
                .await
                .context("acking alert")?;

            match serde_json::from_slice::<Alert>(&delivery.data) {
                Ok(alert) => {
                    self.metrics
                        .inc_alerts_received(&self.exchange, &self.queue, &alert.kind);
                    if alerts_tx.send(alert).await.is_err() {
                        // Detector gone; nothing left to feed.
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::error!("couldn't unmarshal alert json: {e}");
                    self.metrics
                        .inc_alerts_unreadable(&self.exchange, &self.queue);
                }
            }
        }
    }
}
