use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dynamic_detector::config::DetectorConfig;
use dynamic_detector::detector::{AlertTable, DynamicDetector, SystemClock};
use dynamic_detector::metrics::Metrics;
use dynamic_detector::{receiver, sync, worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (DETECTOR_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("DETECTOR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("dynamic_detector=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = DetectorConfig::parse();
    tracing::info!(
        input = %config.input_queue,
        outputs = ?config.output_queues,
        broker = %config.broker,
        "starting dynamic detector"
    );

    let metrics = Arc::new(Metrics::new()?);
    let table = AlertTable::shared();

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!("installing SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down..."),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down..."),
            }
            token.cancel();
        });
    }

    let (alerts_rx, errors_rx) =
        receiver::register_for_alerts(token.child_token(), &config, Arc::clone(&metrics));

    let mut detector = DynamicDetector::new(
        Arc::clone(&table),
        alerts_rx,
        errors_rx,
        Arc::clone(&metrics),
        Arc::new(SystemClock),
    );

    // Best-effort warm start from a sibling replica.
    sync::initial_alert_load(&config.peer_alerts_url, &mut detector).await;

    {
        let table = Arc::clone(&table);
        let metrics = Arc::clone(&metrics);
        let addr = config.alert_server_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = sync::serve(&addr, table, metrics).await {
                tracing::error!("alert server failed: {e:#}");
            }
        });
    }

    tracing::info!("initialisation complete");

    worker::run(token, &config, detector).await
}
