//! Peer state sync: the snapshot HTTP surface and the boot-time pull.
//!
//! `GET /alerts` serves the current alert table so a sibling replica can
//! warm-start across a rolling restart; `GET /metrics` serves the
//! Prometheus registry. At boot each instance pulls its peer's snapshot
//! best-effort: the first instance in a replica set has no peer, so any
//! failure just means starting empty.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;

use crate::alert::AlertsSnapshot;
use crate::detector::{DynamicDetector, SharedAlertTable};
use crate::metrics::Metrics;

/// How long to wait for the peer before deciding there is none.
const PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct SyncState {
    table: SharedAlertTable,
    metrics: Arc<Metrics>,
}

/// Router serving `/alerts` and `/metrics`.
pub fn router(table: SharedAlertTable, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/alerts", get(serve_alerts))
        .route("/metrics", get(serve_metrics))
        .with_state(SyncState { table, metrics })
}

/// Bind and serve until the process exits.
pub async fn serve(addr: &str, table: SharedAlertTable, metrics: Arc<Metrics>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding alert server on {addr}"))?;
    tracing::info!(%addr, "alert snapshot server listening");
    axum::serve(listener, router(table, metrics))
        .await
        .context("alert server")?;
    Ok(())
}

async fn serve_alerts(State(state): State<SyncState>) -> impl IntoResponse {
    tracing::info!("peer requested the current alert state");
    let snapshot = state.table.read().snapshot();
    match serde_json::to_vec(&snapshot) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("error marshalling alert state for peer: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn serve_metrics(State(state): State<SyncState>) -> String {
    state.metrics.encode()
}

/// Pull the peer's alert table into the detector. Never fails: anything
/// going wrong downgrades to an empty start with a warning.
pub async fn initial_alert_load(url: &str, detector: &mut DynamicDetector) {
    let snapshot = match fetch_snapshot(url).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(
                "no state to load from {url}, assuming this is the first \
                 dynamic detector and starting with empty state"
            );
            tracing::info!("error during initial load: {e:#}");
            return;
        }
    };
    tracing::info!(alerts = snapshot.alerts.len(), "loading initial state from peer");
    detector.load_snapshot(snapshot);
}

async fn fetch_snapshot(url: &str) -> Result<AlertsSnapshot> {
    let client = reqwest::Client::builder()
        .timeout(PEER_FETCH_TIMEOUT)
        .build()
        .context("building http client")?;
    let resp = client
        .get(url)
        .send()
        .await
        .context("requesting peer state")?
        .error_for_status()
        .context("peer returned an error status")?;
    resp.json().await.context("decoding peer state")
}
