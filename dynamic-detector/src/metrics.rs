//! Prometheus series for the detector.
//!
//! The registry is per-process and owned here rather than global, so tests
//! can build as many instances as they like without label collisions.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Every sample this service emits carries this analytic label.
const ANALYTIC: &str = "dynamic-detector";

pub struct Metrics {
    registry: Registry,
    alerts_received: IntCounterVec,
    alerts_unreadable: IntCounterVec,
    indicators_added: IntCounterVec,
    alert_db_size: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let alerts_received = IntCounterVec::new(
            Opts::new("alerts_received", "number of alerts received"),
            &["analytic", "exchange", "queue", "type", "alert_type"],
        )?;
        registry.register(Box::new(alerts_received.clone()))?;

        let alerts_unreadable = IntCounterVec::new(
            Opts::new("alerts_unreadable", "number of alerts unreadable"),
            &["analytic", "exchange", "queue", "type"],
        )?;
        registry.register(Box::new(alerts_unreadable.clone()))?;

        let indicators_added = IntCounterVec::new(
            Opts::new(
                "indicators_added_to_events",
                "number of indicators added to events",
            ),
            &["analytic", "type"],
        )?;
        registry.register(Box::new(indicators_added.clone()))?;

        let alert_db_size = IntGaugeVec::new(
            Opts::new("alert_db_size", "number of alerts currently stored"),
            &["analytic"],
        )?;
        registry.register(Box::new(alert_db_size.clone()))?;

        let metrics = Self {
            registry,
            alerts_received,
            alerts_unreadable,
            indicators_added,
            alert_db_size,
        };
        metrics.set_alert_db_size(0);
        Ok(metrics)
    }

    pub fn inc_alerts_received(&self, exchange: &str, queue: &str, alert_type: &str) {
        self.alerts_received
            .with_label_values(&[ANALYTIC, exchange, queue, "amqp", alert_type])
            .inc();
    }

    pub fn inc_alerts_unreadable(&self, exchange: &str, queue: &str) {
        self.alerts_unreadable
            .with_label_values(&[ANALYTIC, exchange, queue, "amqp"])
            .inc();
    }

    pub fn inc_indicators_added(&self, indicator_type: &str) {
        self.indicators_added
            .with_label_values(&[ANALYTIC, indicator_type])
            .inc();
    }

    pub fn set_alert_db_size(&self, size: usize) {
        self.alert_db_size
            .with_label_values(&[ANALYTIC])
            .set(size as i64);
    }

    /// Text exposition for the `/metrics` endpoint.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::error!("encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
