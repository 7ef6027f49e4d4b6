//! Store events and the sinks that receive them
//!
//! Every store reports successful mutations and searches to an injected
//! [`EventSink`]. Sinks are called after the store lock is released and
//! cannot fail the operation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{LoadSummary, RecordId};

/// Types of store events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    RecordRestored,
    RecordPurged,
    RecordsLoaded,
    SearchExecuted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RecordCreated => "record_created",
            EventType::RecordUpdated => "record_updated",
            EventType::RecordDeleted => "record_deleted",
            EventType::RecordRestored => "record_restored",
            EventType::RecordPurged => "record_purged",
            EventType::RecordsLoaded => "records_loaded",
            EventType::SearchExecuted => "search_executed",
        }
    }
}

/// A store event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Backend that emitted the event
    pub backend: String,
    /// Related record ID (if applicable)
    pub record_id: Option<RecordId>,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Additional data
    pub detail: Option<serde_json::Value>,
}

impl StoreEvent {
    fn new(event_type: EventType, backend: &str, record_id: Option<&str>) -> Self {
        Self {
            event_type,
            backend: backend.to_string(),
            record_id: record_id.map(str::to_string),
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn record_created(backend: &str, id: &str) -> Self {
        Self::new(EventType::RecordCreated, backend, Some(id))
    }

    pub fn record_updated(backend: &str, id: &str) -> Self {
        Self::new(EventType::RecordUpdated, backend, Some(id))
    }

    pub fn record_deleted(backend: &str, id: &str) -> Self {
        Self::new(EventType::RecordDeleted, backend, Some(id))
    }

    pub fn record_restored(backend: &str, id: &str) -> Self {
        Self::new(EventType::RecordRestored, backend, Some(id))
    }

    pub fn record_purged(backend: &str, id: &str) -> Self {
        Self::new(EventType::RecordPurged, backend, Some(id))
    }

    pub fn records_loaded(backend: &str, summary: &LoadSummary) -> Self {
        let mut event = Self::new(EventType::RecordsLoaded, backend, None);
        event.detail = Some(serde_json::json!({
            "inserted": summary.inserted,
            "updated": summary.updated,
            "unchanged": summary.unchanged,
            "total": summary.total(),
        }));
        event
    }

    pub fn search_executed(backend: &str, hits: usize) -> Self {
        let mut event = Self::new(EventType::SearchExecuted, backend, None);
        event.detail = Some(serde_json::json!({ "hits": hits }));
        event
    }
}

/// Receiver of store events
pub trait EventSink: Send + Sync {
    fn record(&self, event: &StoreEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: &StoreEvent) {}
}

/// Emits events as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &StoreEvent) {
        tracing::info!(
            target: "kstore::events",
            event = event.event_type.as_str(),
            backend = %event.backend,
            record_id = event.record_id.as_deref().unwrap_or(""),
            detail = %event.detail.as_ref().map(|d| d.to_string()).unwrap_or_default(),
            "store event"
        );
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StoreEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the collected events
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &StoreEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Default sink for new stores
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopSink)
}
