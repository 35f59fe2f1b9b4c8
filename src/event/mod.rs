//! Internal event plumbing
//!
//! - CloudEvents envelope shared with the internal bus
//! - Activity <-> event conversion
//! - Writer pool and bus clients

pub mod bus;
pub mod converter;
pub mod writer;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use bus::{BusError, EventWriter, QueueClient, QueueSubscription, WriterClient};
pub use converter::{activity_to_event, event_to_activity, html_to_text};
pub use writer::WriterPool;

pub const SPEC_VERSION: &str = "1.0";

/// CloudEvents 1.0 envelope (JSON format)
///
/// Extension attributes sit next to the core ones and are collected
/// into `attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub specversion: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl CloudEvent {
    pub fn new(id: impl Into<String>, source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            specversion: SPEC_VERSION.to_string(),
            kind: kind.into(),
            datacontenttype: None,
            data: None,
            attributes: BTreeMap::new(),
        }
    }

    /// String attribute, empty when missing or not a string
    pub fn attr_str(&self, name: &str) -> &str {
        self.attributes
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Text payload; non-string payloads are rendered as JSON
    pub fn text(&self) -> String {
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}
