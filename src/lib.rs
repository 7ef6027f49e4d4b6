//! kstore - Structured knowledge record store
//!
//! Persistent facts, messages, decisions and actions for agent runtimes,
//! queried through a boolean filter tree over in-process, JSON file and
//! SQLite backends.

pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;

pub use config::{open_store, SqlConfig, StoreConfig};
pub use error::{ErrorKind, KnowledgeError, Result};
pub use events::{EventSink, MemorySink, NoopSink, StoreEvent, TracingSink};
pub use storage::{
    Condition, FileStore, Filter, FilterGroup, KnowledgeStore, MemoryStore, SqliteStore,
    StoreInfo,
};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
