//! Boolean-tree IOC matching.
//!
//! An IOC (indicator of compromise) is an expression tree over leaf
//! patterns, combined with AND/OR/NOT operators. The root of a tree
//! carries an [`Indicator`] payload; when the tree matches an [`Event`],
//! that payload is what gets surfaced on the event.
//!
//! The [`Matcher`] stores loaded trees and evaluates every incoming event
//! against all of them. It has no interior locking: a single owner loads,
//! removes and looks up.

pub mod engine;
pub mod event;
pub mod types;

pub use engine::Matcher;
pub use event::{DnsMessage, DnsName, Event, HttpRequest};
pub use types::{Indicator, IndicatorNode, Operator, Pattern};
