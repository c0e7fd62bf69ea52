use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Emitted when a session opens. Session lifecycle events are critical:
/// admission never samples, dedups or rate limits them, and the dispatch
/// queue never evicts them.
pub const SESSION_START: &str = "$session_start";
/// Emitted when a session closes. Critical, like [`SESSION_START`].
pub const SESSION_END: &str = "$session_end";
/// Error events get their own sampling rate, configured separately from
/// the general one.
pub const EXCEPTION: &str = "$exception";

/// A caller-submitted event, before enrichment. Everything except the name
/// is optional; admission fills in what is missing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl RawEvent {
    pub fn new(event: impl Into<String>) -> Self {
        RawEvent {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An event that passed enrichment: id and timestamp assigned, ambient
/// context attached. This is the unit held in every buffer and shipped in
/// batches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CapturedEvent {
    pub uuid: Uuid,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl CapturedEvent {
    pub(crate) fn from_raw(
        raw: RawEvent,
        now: DateTime<Utc>,
        page_url: Option<String>,
        device: Option<String>,
    ) -> Self {
        CapturedEvent {
            uuid: raw.uuid.unwrap_or_else(Uuid::now_v7),
            event: raw.event,
            timestamp: raw.timestamp.unwrap_or(now),
            properties: raw.properties,
            page_url,
            device,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.event == SESSION_START || self.event == SESSION_END
    }

    /// Serialized size, used to refuse events above the payload ceiling.
    pub fn approximate_size(&self) -> usize {
        serde_json::to_vec(self).map(|body| body.len()).unwrap_or(0)
    }
}

/// The wire unit: one session's events plus submission metadata. Built
/// fresh for each delivery attempt series.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Batch {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub events: Vec<CapturedEvent>,
    pub sent_at: DateTime<Utc>,
    pub lib: String,
    pub lib_version: String,
}

impl Batch {
    pub fn new(
        session_id: String,
        user_id: Option<String>,
        events: Vec<CapturedEvent>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Batch {
            session_id,
            user_id,
            events,
            sent_at,
            lib: "beacon-rust".to_string(),
            lib_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
