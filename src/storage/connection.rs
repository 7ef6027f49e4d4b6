//! SQLite connection management with WAL mode support
//!
//! The SQL store uses two kinds of connection to the same database file:
//! one DDL connection for migrations and a round-robin pool of CRUD
//! connections for everything else.

use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{KnowledgeError, Result};
use crate::storage::evaluate::compare_generic;

/// Name of the SQL function wrapping the generic comparator
pub const COMPARE_FN: &str = "kb_compare";

/// Open a connection with the store's pragmas and functions
pub fn create_connection(path: &str, busy_timeout_ms: u64) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open_with_flags(path, flags)?;

    configure_pragmas(&conn, busy_timeout_ms)?;
    register_functions(&conn)?;
    Ok(conn)
}

/// WAL for concurrent readers alongside one writer
fn configure_pragmas(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA wal_autocheckpoint=1000;
        PRAGMA busy_timeout={};
        PRAGMA cache_size=-64000;
        PRAGMA temp_store=MEMORY;
        "#,
        busy_timeout_ms
    ))?;
    Ok(())
}

/// Register `kb_compare(a, b)`, returning -1, 0 or 1. NULL compares as ''.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        COMPARE_FN,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let lhs = sql_text(ctx.get_raw(0));
            let rhs = sql_text(ctx.get_raw(1));
            Ok(compare_generic(&lhs, &rhs) as i64)
        },
    )?;
    Ok(())
}

fn sql_text(value: rusqlite::types::ValueRef<'_>) -> String {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => crate::storage::filter::format_number(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

/// Connection pool for concurrent access
pub struct ConnectionPool {
    pool: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Create a connection pool with the specified size
    pub fn new(path: &str, pool_size: usize, busy_timeout_ms: u64) -> Result<Self> {
        if pool_size == 0 {
            return Err(KnowledgeError::Config(
                "connection pool size must be at least 1".to_string(),
            ));
        }

        let mut pool = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = create_connection(path, busy_timeout_ms)?;
            pool.push(Arc::new(Mutex::new(conn)));
        }

        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.pool.len()
    }

    /// Get a connection from the pool (round-robin)
    pub fn get(&self) -> Arc<Mutex<Connection>> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }

    /// Execute a function with a connection from the pool
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn_arc = self.get();
        let conn = conn_arc.lock();
        f(&conn)
    }

    /// Execute a function within a transaction. Rolled back if `f` fails.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn_arc = self.get();
        let mut conn = conn_arc.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
