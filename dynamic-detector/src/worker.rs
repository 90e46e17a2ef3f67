//! The queue worker: drives the detector from the input queue and
//! forwards annotated events to the output queues.

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::detector::DynamicDetector;

/// In-flight window on the event stream.
const PREFETCH: u16 = 100;

/// Consume events from the input queue, run each through the detector and
/// publish the result to every output queue. Returns on cancellation, or
/// with an error when the transport or the detector fails fatally.
pub async fn run(
    token: CancellationToken,
    config: &DetectorConfig,
    mut detector: DynamicDetector,
) -> Result<()> {
    let conn = Connection::connect(&config.broker, ConnectionProperties::default())
        .await
        .context("connecting to broker")?;
    let channel = conn.create_channel().await.context("opening channel")?;
    channel
        .basic_qos(PREFETCH, BasicQosOptions::default())
        .await
        .context("setting prefetch")?;

    let durable = || QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };
    channel
        .queue_declare(&config.input_queue, durable(), FieldTable::default())
        .await
        .context("declaring input queue")?;
    for queue in &config.output_queues {
        channel
            .queue_declare(queue, durable(), FieldTable::default())
            .await
            .context("declaring output queue")?;
    }

    let mut consumer = channel
        .basic_consume(
            &config.input_queue,
            "dynamic-detector",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("starting event consumer")?;
    tracing::info!(
        queue = %config.input_queue,
        outputs = ?config.output_queues,
        "worker consuming events"
    );

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("worker shutting down");
                return Ok(());
            }
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else {
            anyhow::bail!("event consumer stream closed");
        };
        let delivery = delivery.context("receiving event delivery")?;

        // A handle error means the alert feed is gone; fail loudly rather
        // than keep serving events against a stale indicator set.
        let output = detector.handle(&delivery.data)?;

        if let Some(payload) = output {
            for queue in &config.output_queues {
                channel
                    .basic_publish(
                        "",
                        queue,
                        BasicPublishOptions::default(),
                        &payload,
                        BasicProperties::default(),
                    )
                    .await
                    .context("publishing event")?;
            }
        }
        delivery
            .ack(BasicAckOptions::default())
            .await
            .context("acking event")?;
    }
}
