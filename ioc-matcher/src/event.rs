//! The pipeline event record.
//!
//! Events pass through the enrichment service opaquely except for the
//! `indicators` field, so only the handful of fields the matcher inspects
//! are modelled; everything else rides in a flattened map and is preserved
//! verbatim on re-serialisation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Indicator;

/// A network observation flowing through the analytics pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Identifier of the probe/host the observation came from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// Source address stack, e.g. `["ipv4:10.8.0.44", "udp:57291"]`.
    /// Each entry is `"<class>:<value>"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    /// Destination address stack, same form as `src`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dest: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_message: Option<DnsMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequest>,
    /// Indicators attached by this or an upstream analytic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<Vec<Indicator>>,
    /// Every field this service does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<DnsName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<DnsName>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsName {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Extract the values a leaf pattern of the given type compares against.
    ///
    /// - `hostname`: all DNS query and answer names
    /// - `useragent`: the User-Agent request header
    /// - `device`: the probe identifier
    /// - `src.<class>` / `dest.<class>`: values of that side's address
    ///   entries with the given class (`src.ipv4` yields addresses,
    ///   `src.tcp` yields port numbers)
    ///
    /// Unknown selectors yield nothing, so their patterns never match.
    pub fn values_for(&self, kind: &str) -> Vec<String> {
        match kind {
            "device" => {
                if self.device.is_empty() {
                    Vec::new()
                } else {
                    vec![self.device.clone()]
                }
            }
            "hostname" => self
                .dns_message
                .iter()
                .flat_map(|m| m.query.iter().chain(m.answer.iter()))
                .filter(|n| !n.name.is_empty())
                .map(|n| n.name.clone())
                .collect(),
            "useragent" => self
                .http_request
                .iter()
                .flat_map(|r| r.header.iter())
                .filter(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                .map(|(_, v)| v.clone())
                .collect(),
            _ => {
                if let Some(class) = kind.strip_prefix("src.") {
                    address_values(&self.src, class)
                } else if let Some(class) = kind.strip_prefix("dest.") {
                    address_values(&self.dest, class)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Append indicators, creating the container if absent. Pre-existing
    /// entries keep their order; new ones go after.
    pub fn append_indicators(&mut self, found: Vec<Indicator>) {
        self.indicators.get_or_insert_with(Vec::new).extend(found);
    }
}

fn address_values(stack: &[String], class: &str) -> Vec<String> {
    stack
        .iter()
        .filter_map(|entry| entry.split_once(':'))
        .filter(|(c, _)| *c == class)
        .map(|(_, v)| v.to_string())
        .collect()
}
