//! The detector core: alert table, IOC lifecycle and the event loop.
//!
//! One task owns the detector and with it the matcher, the IOC map and the
//! write side of the alert table. Its three inputs (the alert channel, the
//! receiver error channel and the eviction deadline) are drained without
//! blocking from [`DynamicDetector::update_state`], which runs before
//! every event. The alert table itself sits behind a read-write lock so
//! the peer-sync server can serve a point-in-time snapshot without going
//! through the event loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use ioc_matcher::{Event, IndicatorNode, Matcher};

use crate::alert::{Alert, AlertRecord, AlertsSnapshot};
use crate::ioc::IocBuilder;
use crate::metrics::Metrics;
use crate::receiver::ReceiverError;

/// Period of the eviction timer, seconds. Upper bound on eviction lag.
const TIMEOUT_PERIOD_SECS: i64 = 5;

/// Wall clock as a capability so tests can drive time.
pub trait Clock: Send + Sync {
    /// Current time, unix seconds.
    fn now_unix(&self) -> i64;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// One alert table row: the alert and its absolute expiry.
#[derive(Debug, Clone)]
struct AlertEntry {
    alert: Alert,
    expires: i64,
}

/// The authoritative alert store, keyed by canonical alert identity.
#[derive(Debug, Default)]
pub struct AlertTable {
    entries: HashMap<String, AlertEntry>,
}

/// The table handle shared between the detector (writer) and the
/// peer-sync server (reader).
pub type SharedAlertTable = Arc<RwLock<AlertTable>>;

impl AlertTable {
    pub fn shared() -> SharedAlertTable {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clone the current state into the peer-sync wire form.
    pub fn snapshot(&self) -> AlertsSnapshot {
        AlertsSnapshot {
            alerts: self
                .entries
                .values()
                .map(|e| AlertRecord {
                    alert: e.alert.clone(),
                    timeout: e.expires,
                })
                .collect(),
        }
    }
}

/// Converts alerts into loaded IOCs, ages them out, and annotates events.
pub struct DynamicDetector {
    table: SharedAlertTable,
    /// Alert key → the IOC tree loaded for it. Kept strictly in lockstep
    /// with the table: exactly one loaded tree per entry.
    iocs: HashMap<String, IndicatorNode>,
    matcher: Matcher,
    builder: IocBuilder,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    alerts_rx: mpsc::Receiver<Alert>,
    errors_rx: mpsc::Receiver<ReceiverError>,
    /// Next eviction deadline, unix seconds.
    next_timeout: i64,
}

impl DynamicDetector {
    pub fn new(
        table: SharedAlertTable,
        alerts_rx: mpsc::Receiver<Alert>,
        errors_rx: mpsc::Receiver<ReceiverError>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let next_timeout = clock.now_unix() + TIMEOUT_PERIOD_SECS;
        Self {
            table,
            iocs: HashMap::new(),
            matcher: Matcher::new(),
            builder: IocBuilder::new(),
            clock,
            metrics,
            alerts_rx,
            errors_rx,
            next_timeout,
        }
    }

    /// The loaded-IOC engine, read-only.
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Store an alert for `ttl` seconds and make sure its IOC is loaded.
    ///
    /// Non-positive TTLs are a total no-op. Re-adding a known alert only
    /// pushes its expiry out; the IOC is not rebuilt or reloaded.
    pub fn add_alert(&mut self, alert: Alert) {
        if alert.ttl <= 0 {
            return;
        }
        let expires = self.clock.now_unix() + alert.ttl;
        self.insert(alert, expires);
    }

    /// Peer-sync variant of [`Self::add_alert`]: the absolute expiry is
    /// already known. Entries whose expiry has passed are dropped.
    pub fn add_existing_alert(&mut self, alert: Alert, timeout: i64) {
        if timeout <= self.clock.now_unix() {
            return;
        }
        self.insert(alert, timeout);
    }

    /// Apply a peer's snapshot at boot.
    pub fn load_snapshot(&mut self, snapshot: AlertsSnapshot) {
        for record in snapshot.alerts {
            self.add_existing_alert(record.alert, record.timeout);
        }
    }

    fn insert(&mut self, alert: Alert, expires: i64) {
        let key = alert.canonical_key();
        if !self.iocs.contains_key(&key) {
            let Some(ioc) = self.builder.build(&alert) else {
                // No IOC, no entry: an alert we cannot match is not stored.
                return;
            };
            tracing::info!(alert_type = %alert.kind, "alert not seen before, creating IOC");
            self.matcher.load_node(ioc.clone());
            self.iocs.insert(key.clone(), ioc);
        }
        self.table
            .write()
            .entries
            .insert(key, AlertEntry { alert, expires });
        self.metrics.set_alert_db_size(self.table.read().len());
    }

    /// Evict every entry whose expiry has passed, withdrawing its IOC.
    pub fn timeout_alerts(&mut self) {
        let now = self.clock.now_unix();
        let mut table = self.table.write();
        let before = table.len();
        let expired: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, e)| e.expires < now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            table.entries.remove(key);
            if let Some(ioc) = self.iocs.remove(key) {
                self.matcher.remove_node(&ioc);
            }
        }
        let after = table.len();
        drop(table);

        if after != before {
            tracing::info!(evicted = before - after, remaining = after, "timed out alerts");
        }
        self.metrics.set_alert_db_size(after);
    }

    /// Drain pending bookkeeping without blocking, in priority order:
    /// a receiver error is fatal and returned, queued alerts are stored,
    /// and the eviction deadline fires when it has passed. Returns as
    /// soon as nothing is ready.
    pub fn update_state(&mut self) -> Result<(), ReceiverError> {
        loop {
            if let Ok(err) = self.errors_rx.try_recv() {
                tracing::error!("alert receiver has reported an error: {err}");
                return Err(err);
            }
            if let Ok(alert) = self.alerts_rx.try_recv() {
                self.add_alert(alert);
                continue;
            }
            if self.clock.now_unix() >= self.next_timeout {
                self.timeout_alerts();
                self.next_timeout = self.clock.now_unix() + TIMEOUT_PERIOD_SECS;
                continue;
            }
            return Ok(());
        }
    }

    /// Process one raw event message: drain pending state, annotate the
    /// event with matching indicators, and return the serialised result
    /// for forwarding. `Ok(None)` means the message was dropped.
    pub fn handle(&mut self, raw: &[u8]) -> Result<Option<Vec<u8>>, ReceiverError> {
        self.update_state()?;

        let mut event: Event = match serde_json::from_slice(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("couldn't unmarshal event json: {e}");
                return Ok(None);
            }
        };

        self.annotate(&mut event);

        match serde_json::to_vec(&event) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                tracing::error!("event json marshal error: {e}");
                Ok(None)
            }
        }
    }

    /// Append any matching indicators to the event. Indicators the
    /// matcher returns without a probability get the default confidence
    /// of 1.0. Pre-existing indicators are preserved, never overwritten.
    fn annotate(&mut self, event: &mut Event) {
        let mut found = self.matcher.lookup(event);
        if found.is_empty() {
            return;
        }
        for ind in &mut found {
            if ind.probability == 0.0 {
                ind.probability = 1.0;
            }
            self.metrics.inc_indicators_added(&ind.kind);
        }
        event.append_indicators(found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock(AtomicI64);

    impl TestClock {
        fn new(start: i64) -> Self {
            Self(AtomicI64::new(start))
        }

        fn set(&self, now: i64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now_unix(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    const T0: i64 = 1_700_000_000;

    struct Harness {
        detector: DynamicDetector,
        clock: Arc<TestClock>,
        alerts_tx: mpsc::Sender<Alert>,
        errors_tx: mpsc::Sender<ReceiverError>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(TestClock::new(T0));
        let (alerts_tx, alerts_rx) = mpsc::channel(100);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let metrics = Arc::new(Metrics::new().unwrap());
        let detector = DynamicDetector::new(
            AlertTable::shared(),
            alerts_rx,
            errors_rx,
            metrics,
            clock.clone(),
        );
        Harness {
            detector,
            clock,
            alerts_tx,
            errors_tx,
        }
    }

    fn dns_alert() -> Alert {
        serde_json::from_str(
            r#"{
                "type": "dns",
                "ttl": 10,
                "device": "a-dev",
                "src": {"ip": "ipv4:123.123.123.123"},
                "dest": {"ip": "ipv4:321.321.321.321"},
                "indicator": {
                    "type": "hostname",
                    "value": "blah.com",
                    "category": "covert.dns-tunnel",
                    "probability": 0.9,
                    "id": "b1769a6b-80c0-40e5-9287-a9a5d4262741"
                }
            }"#,
        )
        .unwrap()
    }

    /// The alert matching [`TUNNEL_EVENT`].
    fn tunnel_alert() -> Alert {
        serde_json::from_str(
            r#"{
                "type": "dns",
                "ttl": 10,
                "device": "theatregoing-mac",
                "src": {"ip": "ipv4:10.8.0.44"},
                "dest": {"ip": "ipv4:8.8.8.8"},
                "indicator": {
                    "type": "hostname",
                    "value": "blah.com",
                    "category": "covert.dns-tunnel",
                    "probability": 0.9,
                    "id": "b1769a6b-80c0-40e5-9287-a9a5d4262741"
                }
            }"#,
        )
        .unwrap()
    }

    const TUNNEL_EVENT: &str = r#"{
        "id": "8a92cbb6-e5e4-4c1a-81b2-7a3d5f9f1f3a",
        "action": "dns_message",
        "device": "theatregoing-mac",
        "time": "2020-01-01T00:00:00.000Z",
        "src": ["ipv4:10.8.0.44", "udp:57291"],
        "dest": ["ipv4:8.8.8.8", "udp:53"],
        "dns_message": {
            "type": "query",
            "query": [{"name": "blah.com", "type": "A", "class": "IN"}]
        }
    }"#;

    #[test]
    fn test_add_alert_stores_expiry() {
        let mut h = harness();
        let alert = dns_alert();
        h.detector.add_alert(alert.clone());

        let table = h.detector.table.read();
        assert_eq!(table.len(), 1);
        let entry = &table.entries[&alert.canonical_key()];
        assert_eq!(entry.expires, T0 + alert.ttl);
    }

    #[test]
    fn test_alert_creates_and_loads_ioc() {
        let mut h = harness();
        assert_eq!(h.detector.matcher().node_count(), 0);

        h.detector.add_alert(dns_alert());

        assert_eq!(h.detector.iocs.len(), 1);
        // Root + hostname + device + both IP leaves.
        assert_eq!(h.detector.matcher().node_count(), 5);
    }

    #[test]
    fn test_timeout_evicts_after_ttl() {
        let mut h = harness();
        h.detector.add_alert(dns_alert());
        assert_eq!(h.detector.table.read().len(), 1);

        h.clock.set(T0 + 15);
        h.detector.timeout_alerts();

        assert!(h.detector.table.read().is_empty());
        assert!(h.detector.iocs.is_empty());
        assert_eq!(h.detector.matcher().node_count(), 0);
    }

    #[test]
    fn test_duplicate_alert_extends_expiry_only() {
        let mut h = harness();
        let alert = dns_alert();
        h.detector.add_alert(alert.clone());

        h.clock.set(T0 + 5);
        h.detector.add_alert(alert.clone());

        let table = h.detector.table.read();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.entries[&alert.canonical_key()].expires,
            T0 + 5 + alert.ttl
        );
        drop(table);
        assert_eq!(h.detector.iocs.len(), 1);
        assert_eq!(h.detector.matcher().node_count(), 5);
    }

    #[test]
    fn test_non_positive_ttl_is_a_total_no_op() {
        let mut h = harness();
        let mut alert = dns_alert();
        alert.ttl = -10;
        h.detector.add_alert(alert);

        assert!(h.detector.table.read().is_empty());
        assert!(h.detector.iocs.is_empty());
        assert_eq!(h.detector.matcher().node_count(), 0);
    }

    #[test]
    fn test_unknown_alert_type_is_not_stored() {
        let mut h = harness();
        let mut alert = dns_alert();
        alert.kind = "no-such-type".into();
        h.detector.add_alert(alert);

        assert!(h.detector.table.read().is_empty());
        assert!(h.detector.iocs.is_empty());
    }

    #[test]
    fn test_multi_alert_staggered_timeout() {
        let mut h = harness();
        h.detector.add_alert(dns_alert());

        let mut second = dns_alert();
        second.ttl = 20;
        second.device = "a-n-other-dev".into();
        second.indicator.value = "a.tunnel.com".into();
        h.detector.add_alert(second);

        assert_eq!(h.detector.table.read().len(), 2);
        assert_eq!(h.detector.matcher().node_count(), 10);

        h.clock.set(T0 + 15);
        h.detector.timeout_alerts();
        assert_eq!(h.detector.table.read().len(), 1);
        assert_eq!(h.detector.matcher().node_count(), 5);

        h.clock.set(T0 + 25);
        h.detector.timeout_alerts();
        assert!(h.detector.table.read().is_empty());
        assert_eq!(h.detector.matcher().node_count(), 0);
    }

    #[test]
    fn test_useragent_indicator_on_dns_alert_builds_two_nodes() {
        let mut h = harness();
        let alert: Alert = serde_json::from_str(
            r#"{
                "type": "dns",
                "ttl": 10,
                "indicator": {
                    "type": "useragent",
                    "value": "Testing 123",
                    "category": "anomaly.useragent",
                    "probability": 0.9,
                    "id": "aaaa9a6b-80c0-40e5-9287-a9a5d4262741"
                }
            }"#,
        )
        .unwrap();
        h.detector.add_alert(alert);
        // No device and no IPs: just the root and the hostname leaf.
        assert_eq!(h.detector.matcher().node_count(), 2);
    }

    #[test]
    fn test_externally_loaded_not_tree_is_counted_and_removed() {
        let mut h = harness();
        let tree: IndicatorNode = serde_json::from_str(
            r#"{
                "id": "external-0",
                "operator": "AND",
                "indicator": {"id": "ext", "type": "hostname", "value": "blah"},
                "children": [
                    {"id": "external-1", "pattern": {"type": "device", "value": "a-dev"}},
                    {"id": "external-2", "pattern": {"type": "hostname", "value": "blah", "match": "dns"}},
                    {"id": "external-3", "pattern": {"type": "src.ipv4", "value": "123.123.123.123"}},
                    {"id": "external-4", "operator": "NOT", "children": [
                        {"id": "external-5", "pattern": {"type": "dest.ipv4", "value": "321.321.321.321"}}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        let alert = dns_alert();
        let key = alert.canonical_key();
        h.detector.table.write().entries.insert(
            key.clone(),
            AlertEntry {
                alert,
                expires: T0 + 10,
            },
        );
        h.detector.matcher.load_node(tree.clone());
        h.detector.iocs.insert(key, tree);

        assert_eq!(h.detector.matcher().node_count(), 6);
        assert_eq!(h.detector.matcher().not_count(), 1);

        h.clock.set(T0 + 15);
        h.detector.timeout_alerts();

        assert!(h.detector.table.read().is_empty());
        assert_eq!(h.detector.matcher().node_count(), 0);
        assert_eq!(h.detector.matcher().not_count(), 0);
    }

    #[test]
    fn test_event_gets_matching_indicator() {
        let mut h = harness();
        h.detector.add_alert(tunnel_alert());

        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();
        let event: Event = serde_json::from_slice(&output).unwrap();

        let inds = event.indicators.as_ref().expect("indicator added");
        assert_eq!(inds.len(), 1);
        assert_eq!(inds[0].id, "b1769a6b-80c0-40e5-9287-a9a5d4262741");
        assert_eq!(inds[0].kind, "hostname");
        assert_eq!(inds[0].value, "blah.com");
        assert_eq!(inds[0].category, "covert.dns-tunnel");
        assert_eq!(inds[0].probability, 0.9);
    }

    #[test]
    fn test_existing_indicators_are_preserved() {
        let mut h = harness();
        h.detector.add_alert(tunnel_alert());

        let mut event: Event = serde_json::from_str(TUNNEL_EVENT).unwrap();
        event.indicators = Some(vec![ioc_matcher::Indicator {
            id: "a-test-ioc".into(),
            description: "a test ioc".into(),
            kind: "test".into(),
            value: "string".into(),
            category: "badness".into(),
            source: "pipeline tests".into(),
            ..Default::default()
        }]);
        let raw = serde_json::to_vec(&event).unwrap();

        let output = h.detector.handle(&raw).unwrap().unwrap();
        let enriched: Event = serde_json::from_slice(&output).unwrap();
        let inds = enriched.indicators.as_ref().unwrap();
        assert_eq!(inds.len(), 2);
        assert_eq!(inds[0].id, "a-test-ioc");
        assert_eq!(inds[1].id, "b1769a6b-80c0-40e5-9287-a9a5d4262741");
    }

    #[test]
    fn test_zero_probability_defaults_to_one() {
        let mut h = harness();
        let mut alert = tunnel_alert();
        alert.indicator.probability = 0.0;
        h.detector.add_alert(alert);

        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();
        let event: Event = serde_json::from_slice(&output).unwrap();
        assert_eq!(event.indicators.as_ref().unwrap()[0].probability, 1.0);
    }

    #[test]
    fn test_unreadable_event_is_dropped() {
        let mut h = harness();
        assert!(h.detector.handle(b"not json").unwrap().is_none());
    }

    #[test]
    fn test_event_passes_through_untouched_fields() {
        let mut h = harness();
        h.detector.add_alert(tunnel_alert());

        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(json["action"], "dns_message");
        assert_eq!(json["time"], "2020-01-01T00:00:00.000Z");
        assert_eq!(json["dns_message"]["query"][0]["class"], "IN");
    }

    #[test]
    fn test_handle_drains_queued_alerts_first() {
        let mut h = harness();
        h.alerts_tx.try_send(tunnel_alert()).unwrap();

        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();

        assert_eq!(h.detector.table.read().len(), 1);
        let event: Event = serde_json::from_slice(&output).unwrap();
        assert_eq!(event.indicators.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_receiver_error_is_fatal() {
        let mut h = harness();
        h.errors_tx
            .try_send(ReceiverError {
                reason: "broker gone".into(),
            })
            .unwrap();

        assert!(h.detector.handle(TUNNEL_EVENT.as_bytes()).is_err());
    }

    #[test]
    fn test_handle_triggers_timeout_after_ttl() {
        let mut h = harness();
        h.detector.add_alert(tunnel_alert());

        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();
        let event: Event = serde_json::from_slice(&output).unwrap();
        assert_eq!(event.indicators.as_ref().unwrap().len(), 1);
        assert_eq!(h.detector.table.read().len(), 1);

        h.clock.set(T0 + 15);
        let output = h.detector.handle(TUNNEL_EVENT.as_bytes()).unwrap().unwrap();
        let event: Event = serde_json::from_slice(&output).unwrap();

        assert!(h.detector.table.read().is_empty());
        assert!(event.indicators.is_none());
    }

    #[test]
    fn test_load_snapshot_keeps_future_expiries_only() {
        let mut h = harness();
        let fresh = dns_alert();
        let mut stale = dns_alert();
        stale.indicator.value = "stale.com".into();

        h.detector.load_snapshot(AlertsSnapshot {
            alerts: vec![
                AlertRecord {
                    alert: fresh.clone(),
                    timeout: T0 + 120,
                },
                AlertRecord {
                    alert: stale,
                    timeout: T0 - 1,
                },
            ],
        });

        let table = h.detector.table.read();
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries[&fresh.canonical_key()].expires, T0 + 120);
    }
}
