//! Wire types for indicators and IOC expression trees.
//!
//! Field names follow the pipeline's JSON schema exactly; everything that
//! can be absent is defaulted on input and omitted on output, so partially
//! populated objects round-trip without noise.

use serde::{Deserialize, Serialize};

fn is_zero(p: &f64) -> bool {
    *p == 0.0
}

/// Threat metadata attached to an IOC root and surfaced on matching events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    /// What kind of observable this describes, e.g. `hostname`, `ip-comms`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// The observable itself, e.g. the hostname or address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Threat taxonomy entry, e.g. `covert.dns-tunnel`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    /// Confidence in [0, 1]. Zero means "unset".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub probability: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A leaf pattern: which event field to read and how to compare it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Event field selector, e.g. `hostname`, `device`, `src.ipv4`, `dest.tcp`.
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    /// Comparison algorithm: `dns` (suffix match), `int` (numeric equality),
    /// `string` or empty (string equality).
    #[serde(rename = "match", default, skip_serializing_if = "String::is_empty")]
    pub match_kind: String,
}

/// Boolean operator on an internal tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
    #[serde(rename = "NOT")]
    Not,
}

/// One node of an IOC expression tree.
///
/// Leaves carry a [`Pattern`]; internal nodes carry an [`Operator`] and
/// children; the root additionally carries the [`Indicator`] payload that
/// gets attached to matching events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<Indicator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<IndicatorNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl IndicatorNode {
    /// Number of nodes in this tree, the node itself included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }

    /// Number of NOT nodes in this tree.
    pub fn not_count(&self) -> usize {
        usize::from(self.operator == Some(Operator::Not))
            + self.children.iter().map(Self::not_count).sum::<usize>()
    }
}
