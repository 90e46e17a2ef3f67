//! The pattern-matching engine.
//!
//! Loaded trees are keyed by their root id. Evaluation is recursive and
//! side-effect free: a leaf compares its pattern against the values the
//! event yields for the pattern's field selector; AND requires all
//! children to match, OR any, NOT inverts its child.

use std::collections::HashMap;

use crate::event::Event;
use crate::types::{Indicator, IndicatorNode, Operator, Pattern};

/// Stores loaded IOC trees and evaluates events against all of them.
#[derive(Debug, Default)]
pub struct Matcher {
    roots: HashMap<String, IndicatorNode>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporate a tree. The caller ensures each tree is loaded at most
    /// once; loading a second tree with the same root id replaces the first.
    pub fn load_node(&mut self, node: IndicatorNode) {
        self.roots.insert(node.id.clone(), node);
    }

    /// Withdraw the tree previously loaded with this root.
    pub fn remove_node(&mut self, node: &IndicatorNode) {
        self.roots.remove(&node.id);
    }

    /// Evaluate every loaded tree against the event and return the
    /// indicator payloads attached to the roots of all matching trees.
    /// At most one payload per loaded tree, so no duplicates.
    pub fn lookup(&self, event: &Event) -> Vec<Indicator> {
        self.roots
            .values()
            .filter(|root| eval(root, event))
            .filter_map(|root| root.indicator.clone())
            .collect()
    }

    /// Total node count over all loaded trees.
    pub fn node_count(&self) -> usize {
        self.roots.values().map(IndicatorNode::node_count).sum()
    }

    /// Total NOT-node count over all loaded trees.
    pub fn not_count(&self) -> usize {
        self.roots.values().map(IndicatorNode::not_count).sum()
    }
}

fn eval(node: &IndicatorNode, event: &Event) -> bool {
    if let Some(pattern) = &node.pattern {
        return eval_pattern(pattern, event);
    }
    match node.operator {
        Some(Operator::And) => {
            !node.children.is_empty() && node.children.iter().all(|c| eval(c, event))
        }
        Some(Operator::Or) => node.children.iter().any(|c| eval(c, event)),
        Some(Operator::Not) => node.children.first().is_some_and(|c| !eval(c, event)),
        // Neither pattern nor operator: malformed, never matches.
        None => false,
    }
}

fn eval_pattern(pattern: &Pattern, event: &Event) -> bool {
    let values = event.values_for(&pattern.kind);
    match pattern.match_kind.as_str() {
        "dns" => values.iter().any(|v| dns_suffix_match(v, &pattern.value)),
        "int" => match pattern.value.parse::<i64>() {
            Ok(want) => values.iter().any(|v| v.parse::<i64>() == Ok(want)),
            Err(_) => false,
        },
        // "string" and anything else compare for equality.
        _ => values.iter().any(|v| v == &pattern.value),
    }
}

/// DNS suffix match: the pattern matches the name itself and any
/// subdomain of it, on label boundaries.
fn dns_suffix_match(name: &str, pattern: &str) -> bool {
    name == pattern
        || name
            .strip_suffix(pattern)
            .is_some_and(|head| head.ends_with('.'))
}
