//! In-process knowledge store
//!
//! Records live in two `HashMap`s behind one `RwLock`. Nothing survives
//! `close`.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::error::{KnowledgeError, Result};
use crate::events::{noop_sink, EventSink, StoreEvent};
use crate::storage::backend::{KnowledgeStore, StoreInfo};
use crate::storage::filter::Filter;
use crate::storage::partitions::Partitions;
use crate::types::{LoadSummary, Record};

const BACKEND: &str = "memory";

#[derive(Debug, Default)]
struct State {
    open: bool,
    records: Partitions,
}

/// Volatile store backed by process memory
pub struct MemoryStore {
    state: RwLock<State>,
    events: Arc<dyn EventSink>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            events: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Run `f` against the partitions of an open store, exclusively
    fn write<T>(&self, f: impl FnOnce(&mut Partitions) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        f(&mut state.records)
    }

    fn read<T>(&self, f: impl FnOnce(&Partitions) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        f(&state.records)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeStore for MemoryStore {
    fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.open {
            state.open = true;
            debug!("memory store opened");
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        state.records.clear();
        state.open = false;
        debug!("memory store closed");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.read(|_| Ok(()))
    }

    fn add_record(&self, record: Record) -> Result<Record> {
        let stored = self.write(|parts| parts.add(record, Utc::now()))?;
        debug!(id = %stored.id, "record added");
        self.events.record(&StoreEvent::record_created(BACKEND, &stored.id));
        Ok(stored)
    }

    fn get_record(&self, id: &str) -> Result<Record> {
        self.read(|parts| parts.get(id))
    }

    fn update_record(&self, record: Record) -> Result<Record> {
        let stored = self.write(|parts| parts.update(record, Utc::now()))?;
        debug!(id = %stored.id, "record updated");
        self.events.record(&StoreEvent::record_updated(BACKEND, &stored.id));
        Ok(stored)
    }

    fn delete_record(&self, id: &str) -> Result<()> {
        self.write(|parts| parts.delete(id, Utc::now()))?;
        debug!(id, "record deleted");
        self.events.record(&StoreEvent::record_deleted(BACKEND, id));
        Ok(())
    }

    fn restore_record(&self, id: &str) -> Result<()> {
        self.write(|parts| parts.restore(id, Utc::now()))?;
        debug!(id, "record restored");
        self.events.record(&StoreEvent::record_restored(BACKEND, id));
        Ok(())
    }

    fn purge_record(&self, id: &str) -> Result<()> {
        self.write(|parts| parts.purge(id))?;
        debug!(id, "record purged");
        self.events.record(&StoreEvent::record_purged(BACKEND, id));
        Ok(())
    }

    fn search_records(&self, filter: &Filter) -> Result<Vec<Record>> {
        let hits = self.read(|parts| Ok(parts.search(filter)))?;
        debug!(hits = hits.len(), "search executed");
        self.events.record(&StoreEvent::search_executed(BACKEND, hits.len()));
        Ok(hits)
    }

    fn load_records(&self, records: Vec<Record>) -> Result<LoadSummary> {
        let summary = self.write(|parts| parts.load(records, Utc::now()))?;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "records loaded"
        );
        self.events.record(&StoreEvent::records_loaded(BACKEND, &summary));
        Ok(summary)
    }

    fn info(&self) -> Result<StoreInfo> {
        let state = self.state.read();
        let mut info = StoreInfo::new(BACKEND, false);
        info.open = state.open;
        info.record_count = state.records.live_count();
        info.deleted_count = state.records.deleted_count();
        Ok(info)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
