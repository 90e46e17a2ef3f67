//! Alert wire types and the peer-sync snapshot format.

use ioc_matcher::Indicator;
use serde::{Deserialize, Serialize};

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

/// One endpoint of a network flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommsInfo {
    /// `"<family>:<address>"`, e.g. `"ipv4:1.2.3.4"`. Empty means absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// Zero means absent.
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,
}

/// A time-limited directive from an upstream detector: for the next `ttl`
/// seconds, observations matching this shape indicate the threat described
/// by `indicator`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Dispatch key for IOC construction: `dns`, `ip-comms`,
    /// `bidirect-ip-comms` or `useragent`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Lifetime in seconds. Must be strictly positive to be retained.
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub src: CommsInfo,
    #[serde(default)]
    pub dest: CommsInfo,
    /// Restrict matching to this probe. Empty means any device.
    #[serde(default)]
    pub device: String,
    /// What gets surfaced on events that match the built IOC.
    #[serde(default)]
    pub indicator: Indicator,
}

impl Alert {
    /// Canonical identity key: the alert's stable JSON form. Struct field
    /// order is fixed, so structurally equal alerts serialise identically
    /// and repeated emissions of the same alert collapse to one map entry.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One alert table row as served to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert: Alert,
    /// Absolute expiry, unix seconds.
    pub timeout: i64,
}

/// The `GET /alerts` snapshot body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertsSnapshot {
    pub alerts: Vec<AlertRecord>,
}
