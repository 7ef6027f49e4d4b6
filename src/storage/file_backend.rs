//! JSON file persisted knowledge store
//!
//! The whole store is held in memory and written to a single JSON document
//! on `flush` and `close`:
//!
//! ```json
//! {
//!   "records": { "<id>": { ...record... } },
//!   "deleted_records": { "<id>": { ...record... } }
//! }
//! ```
//!
//! Writes go to a temporary file in the target directory which is then
//! renamed over the target, so a failed flush never leaves a partial file.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{KnowledgeError, Result};
use crate::events::{noop_sink, EventSink, StoreEvent};
use crate::storage::backend::{KnowledgeStore, StoreInfo};
use crate::storage::filter::Filter;
use crate::storage::partitions::Partitions;
use crate::types::{LoadSummary, Record, RecordId};

const BACKEND: &str = "file";

/// On-disk document, as read
#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    records: HashMap<RecordId, Record>,
    #[serde(default)]
    deleted_records: HashMap<RecordId, Record>,
}

/// On-disk document, as written (sorted by ID)
#[derive(Serialize)]
struct DocumentRef<'a> {
    records: BTreeMap<&'a str, &'a Record>,
    deleted_records: BTreeMap<&'a str, &'a Record>,
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    dirty: bool,
    records: Partitions,
}

/// Store persisted to a single JSON file
pub struct FileStore {
    path: PathBuf,
    state: RwLock<State>,
    events: Arc<dyn EventSink>,
}

impl FileStore {
    /// Create a store for `path`, creating missing parent directories
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(KnowledgeError::Config("file path must not be empty".to_string()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            state: RwLock::new(State::default()),
            events: noop_sink(),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether there are changes not yet written
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    fn write<T>(&self, f: impl FnOnce(&mut Partitions) -> Result<(T, bool)>) -> Result<T> {
        let mut state = self.state.write();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        let (out, changed) = f(&mut state.records)?;
        if changed {
            state.dirty = true;
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Partitions) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        f(&state.records)
    }

    fn read_document(&self) -> Result<Partitions> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no store file, starting empty");
                return Ok(Partitions::new());
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            warn!(path = %self.path.display(), "store file is empty, starting empty");
            return Ok(Partitions::new());
        }

        let doc: Document = serde_json::from_slice(&bytes)?;
        Partitions::from_maps(doc.records, doc.deleted_records)
    }

    fn write_document(&self, records: &Partitions) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let doc = DocumentRef {
            records: records.live().iter().map(|(k, v)| (k.as_str(), v)).collect(),
            deleted_records: records
                .deleted()
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
        };

        // The temporary file is removed on drop if anything below fails
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KnowledgeError::Io(e.error))?;
        Ok(())
    }

    /// Write pending changes while holding the write lock
    fn persist_locked(&self, state: &mut State) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        if let Err(e) = self.write_document(&state.records) {
            warn!(path = %self.path.display(), error = %e, "flush failed");
            return Err(e);
        }
        state.dirty = false;
        info!(
            path = %self.path.display(),
            records = state.records.live_count(),
            deleted = state.records.deleted_count(),
            "store flushed"
        );
        Ok(())
    }
}

impl KnowledgeStore for FileStore {
    fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.open {
            return Ok(());
        }
        state.records = self.read_document()?;
        state.dirty = false;
        state.open = true;
        info!(
            path = %self.path.display(),
            records = state.records.live_count(),
            deleted = state.records.deleted_count(),
            "file store opened"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        self.persist_locked(&mut state)?;
        state.records.clear();
        state.open = false;
        debug!(path = %self.path.display(), "file store closed");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.open {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        self.persist_locked(&mut state)
    }

    fn add_record(&self, record: Record) -> Result<Record> {
        let stored = self.write(|parts| Ok((parts.add(record, Utc::now())?, true)))?;
        debug!(id = %stored.id, "record added");
        self.events.record(&StoreEvent::record_created(BACKEND, &stored.id));
        Ok(stored)
    }

    fn get_record(&self, id: &str) -> Result<Record> {
        self.read(|parts| parts.get(id))
    }

    fn update_record(&self, record: Record) -> Result<Record> {
        let stored = self.write(|parts| Ok((parts.update(record, Utc::now())?, true)))?;
        debug!(id = %stored.id, "record updated");
        self.events.record(&StoreEvent::record_updated(BACKEND, &stored.id));
        Ok(stored)
    }

    fn delete_record(&self, id: &str) -> Result<()> {
        self.write(|parts| Ok((parts.delete(id, Utc::now())?, true)))?;
        debug!(id, "record deleted");
        self.events.record(&StoreEvent::record_deleted(BACKEND, id));
        Ok(())
    }

    fn restore_record(&self, id: &str) -> Result<()> {
        self.write(|parts| Ok((parts.restore(id, Utc::now())?, true)))?;
        debug!(id, "record restored");
        self.events.record(&StoreEvent::record_restored(BACKEND, id));
        Ok(())
    }

    fn purge_record(&self, id: &str) -> Result<()> {
        self.write(|parts| Ok((parts.purge(id)?, true)))?;
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
        let summary = self.write(|parts| {
            let summary = parts.load(records, Utc::now())?;
            let changed = summary.inserted + summary.updated > 0;
            Ok((summary, changed))
        })?;
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
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut info = StoreInfo::new(BACKEND, true)
            .with_detail("file_path", self.path.display())
            .with_detail("file_name", file_name);
        info.open = state.open;
        info.dirty = Some(state.dirty);
        info.record_count = state.records.live_count();
        info.deleted_count = state.records.deleted_count();
        Ok(info)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
