//! Store configuration and backend factory

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{KnowledgeError, Result};
use crate::events::EventSink;
use crate::storage::{FileStore, KnowledgeStore, MemoryStore, SqliteStore};

/// Default number of pooled CRUD connections
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// SQLite store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Database path used by the CRUD connection pool
    pub crud_conn: String,
    /// Database path used for migrations; empty means `crud_conn`
    #[serde(default)]
    pub ddl_conn: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Tenant UUID; every row is scoped to it
    pub account_id: String,
}

impl SqlConfig {
    pub fn new(path: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            crud_conn: path.into(),
            ddl_conn: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            account_id: account_id.into(),
        }
    }

    /// Create config from environment variables
    ///
    /// Reads `KSTORE_SQL_CRUD_CONN`, `KSTORE_SQL_DDL_CONN`,
    /// `KSTORE_SQL_MAX_CONNS`, `KSTORE_SQL_BUSY_TIMEOUT_MS` and
    /// `KSTORE_ACCOUNT_ID`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SqlConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| KnowledgeError::Config(format!("{} is not set", key)))
        };

        let crud_conn = required("KSTORE_SQL_CRUD_CONN")?;
        let account_id = required("KSTORE_ACCOUNT_ID")?;
        let ddl_conn = lookup("KSTORE_SQL_DDL_CONN").unwrap_or_default();

        let pool_size = match lookup("KSTORE_SQL_MAX_CONNS") {
            Some(v) => v.trim().parse().map_err(|_| {
                KnowledgeError::Config(format!("KSTORE_SQL_MAX_CONNS is not a number: {}", v))
            })?,
            None => DEFAULT_POOL_SIZE,
        };
        let busy_timeout_ms = match lookup("KSTORE_SQL_BUSY_TIMEOUT_MS") {
            Some(v) => v.trim().parse().map_err(|_| {
                KnowledgeError::Config(format!(
                    "KSTORE_SQL_BUSY_TIMEOUT_MS is not a number: {}",
                    v
                ))
            })?,
            None => DEFAULT_BUSY_TIMEOUT_MS,
        };

        Ok(Self {
            crud_conn,
            ddl_conn,
            pool_size,
            busy_timeout_ms,
            account_id,
        })
    }

    /// Expanded CRUD path
    pub fn crud_path(&self) -> String {
        expand_path(&self.crud_conn)
    }

    /// Expanded DDL path, falling back to the CRUD path
    pub fn ddl_path(&self) -> String {
        if self.ddl_conn.trim().is_empty() {
            self.crud_path()
        } else {
            expand_path(&self.ddl_conn)
        }
    }

    /// Validate and return the normalized account UUID
    pub fn validate(&self) -> Result<Uuid> {
        let crud = self.crud_path();
        if crud.trim().is_empty() {
            return Err(KnowledgeError::Config("crud_conn must not be empty".to_string()));
        }
        for path in [&crud, &self.ddl_path()] {
            if is_in_memory(path) {
                return Err(KnowledgeError::Config(format!(
                    "in-memory database {} is not supported: DDL and CRUD connections must share one database",
                    path
                )));
            }
        }
        if crud != self.ddl_path() {
            return Err(KnowledgeError::Config(format!(
                "ddl_conn ({}) and crud_conn ({}) must refer to the same database",
                self.ddl_path(),
                crud
            )));
        }
        if self.pool_size == 0 {
            return Err(KnowledgeError::Config(
                "pool_size must be at least 1".to_string(),
            ));
        }

        let account = self.account_id.trim();
        if account.is_empty() {
            return Err(KnowledgeError::Config("account ID cannot be empty".to_string()));
        }
        let uuid = Uuid::parse_str(account).map_err(|e| {
            KnowledgeError::Config(format!("invalid account ID format: {}", e))
        })?;
        if uuid.is_nil() {
            return Err(KnowledgeError::Config(
                "account ID cannot be nil UUID".to_string(),
            ));
        }
        Ok(uuid)
    }
}

fn is_in_memory(path: &str) -> bool {
    path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

/// Expand `~` in a configured path
pub fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// Which backend to build, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File { path: String },
    Sqlite(SqlConfig),
}

impl StoreConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::File { .. } => "file",
            StoreConfig::Sqlite(_) => "sqlite",
        }
    }
}

/// Build and open the configured backend
pub fn open_store(config: &StoreConfig, sink: Arc<dyn EventSink>) -> Result<Box<dyn KnowledgeStore>> {
    let store: Box<dyn KnowledgeStore> = match config {
        StoreConfig::Memory => Box::new(MemoryStore::new().with_event_sink(sink)),
        StoreConfig::File { path } => {
            Box::new(FileStore::new(expand_path(path))?.with_event_sink(sink))
        }
        StoreConfig::Sqlite(sql) => Box::new(SqliteStore::new(sql.clone())?.with_event_sink(sink)),
    };

    store.open()?;
    info!(backend = config.backend_name(), "knowledge store ready");
    Ok(store)
}
