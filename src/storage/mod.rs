//! Storage engines for the knowledge store
//!
//! One filter AST and evaluator, one backend trait, three backends.

mod backend;
mod connection;
pub mod evaluate;
mod file_backend;
pub mod filter;
mod memory_backend;
pub mod migrations;
mod partitions;
pub mod sql_builder;
mod sqlite_backend;

pub use backend::{KnowledgeStore, LoadSummary, StoreInfo};
pub use connection::{ConnectionPool, COMPARE_FN};
pub use file_backend::FileStore;
pub use filter::{
    parse_filter, parse_group, ComparisonOperator, Condition, Field, FieldKind, FieldValue,
    Filter, FilterGroup, FilterValue, LogicalOperator, SortDirection,
};
pub use memory_backend::MemoryStore;
pub use partitions::Partitions;
pub use sqlite_backend::SqliteStore;
