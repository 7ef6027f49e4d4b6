//! Storage backend trait shared by every knowledge store
//!
//! This module defines the `KnowledgeStore` trait that all backends
//! implement, so callers can swap the in-process, file and SQLite stores
//! without changing application logic.

use crate::error::Result;
use crate::storage::filter::Filter;
use crate::types::Record;
use serde::Serialize;
use std::collections::BTreeMap;

pub use crate::types::LoadSummary;

/// Introspection data about a store
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreInfo {
    /// Backend name (e.g. "memory", "file", "sqlite")
    pub implementation: String,
    /// Whether the store is currently open
    pub open: bool,
    /// Live records
    pub record_count: usize,
    /// Soft-deleted records
    pub deleted_count: usize,
    /// Whether data survives `close`
    pub persistent: bool,
    /// Unflushed changes, for backends that buffer writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    /// Backend specific details (file path, account, schema version, ...)
    pub details: BTreeMap<String, String>,
}

impl StoreInfo {
    pub fn new(implementation: &str, persistent: bool) -> Self {
        Self {
            implementation: implementation.to_string(),
            persistent,
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    /// Flatten into a string map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.details.clone();
        map.insert("implementation".to_string(), self.implementation.clone());
        map.insert("open".to_string(), self.open.to_string());
        map.insert("record_count".to_string(), self.record_count.to_string());
        map.insert("deleted_count".to_string(), self.deleted_count.to_string());
        map.insert("persistent".to_string(), self.persistent.to_string());
        if let Some(dirty) = self.dirty {
            map.insert("is_dirty".to_string(), dirty.to_string());
        }
        map
    }
}

/// The knowledge store contract
///
/// # Design Principles
///
/// 1. **Sync Interface**: All methods are synchronous and callable from any
///    thread. Async callers wrap them with `spawn_blocking`.
///
/// 2. **Immutable Self**: Methods take `&self`; each backend guards its own
///    state internally.
///
/// 3. **Lifecycle**: Every operation except `open` and `info` fails with
///    `NotOpen` until `open` succeeds.
pub trait KnowledgeStore: Send + Sync {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the store. A no-op on an open store.
    fn open(&self) -> Result<()>;

    /// Close the store, persisting buffered changes first
    fn close(&self) -> Result<()>;

    /// Persist buffered changes
    fn flush(&self) -> Result<()>;

    // ========================================================================
    // Record Operations
    // ========================================================================

    /// Add a new record
    ///
    /// # Returns
    /// The stored record, with `created_at`/`updated_at` populated
    fn add_record(&self, record: Record) -> Result<Record>;

    /// Get a live record by ID
    fn get_record(&self, id: &str) -> Result<Record>;

    /// Replace a live record
    ///
    /// # Returns
    /// The stored record, with `updated_at` refreshed
    fn update_record(&self, record: Record) -> Result<Record>;

    /// Move a live record to the deleted partition
    fn delete_record(&self, id: &str) -> Result<()>;

    /// Move a deleted record back to the live partition
    fn restore_record(&self, id: &str) -> Result<()>;

    /// Remove a record from either partition permanently
    fn purge_record(&self, id: &str) -> Result<()>;

    // ========================================================================
    // Query & Batch Operations
    // ========================================================================

    /// Search records with a filter
    fn search_records(&self, filter: &Filter) -> Result<Vec<Record>>;

    /// Count records matching a filter (limit/offset ignored)
    fn count_records(&self, filter: &Filter) -> Result<usize> {
        // Default: search and count (backends may override)
        let unpaged = Filter {
            limit: 0,
            offset: 0,
            order_by: None,
            ..filter.clone()
        };
        Ok(self.search_records(&unpaged)?.len())
    }

    /// Insert or update a batch of records, all or nothing
    fn load_records(&self, records: Vec<Record>) -> Result<LoadSummary>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Describe the store. Works on a closed store.
    fn info(&self) -> Result<StoreInfo>;

    /// Get the backend name/type
    fn backend_name(&self) -> &'static str;
}
