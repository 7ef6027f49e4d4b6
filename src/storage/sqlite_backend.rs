//! SQLite implementation of the `KnowledgeStore` trait
//!
//! All records of all tenants live in one `knowledge_entry` table keyed by
//! `(account_id, id)`; every statement is scoped to the store's account.
//! Migrations run on a dedicated DDL connection when the store opens, and
//! record operations go through a round-robin pool of CRUD connections.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SqlConfig;
use crate::error::{KnowledgeError, Result};
use crate::events::{noop_sink, EventSink, StoreEvent};
use crate::storage::backend::{KnowledgeStore, StoreInfo};
use crate::storage::connection::{create_connection, ConnectionPool};
use crate::storage::evaluate;
use crate::storage::filter::Filter;
use crate::storage::migrations::run_migrations;
use crate::storage::partitions::{merge_loaded, validate_batch};
use crate::storage::sql_builder::{format_time, SqlBuilder, SELECT_COLUMNS};
use crate::types::{Category, LoadSummary, Record};

const BACKEND: &str = "sqlite";

struct Handles {
    /// Kept open for the lifetime of the store; migrations only
    _ddl: Mutex<Connection>,
    pool: ConnectionPool,
    schema_version: u32,
}

/// SQLite-backed, multi-tenant store
pub struct SqliteStore {
    config: SqlConfig,
    account_id: String,
    state: RwLock<Option<Handles>>,
    events: Arc<dyn EventSink>,
}

impl SqliteStore {
    /// Create a store; the configuration is validated, nothing is opened yet
    pub fn new(config: SqlConfig) -> Result<Self> {
        let account = config.validate()?;
        Ok(Self {
            config,
            account_id: account.to_string(),
            state: RwLock::new(None),
            events: noop_sink(),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn with_pool<T>(&self, f: impl FnOnce(&ConnectionPool) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        let handles = state.as_ref().ok_or(KnowledgeError::NotOpen(BACKEND))?;
        f(&handles.pool)
    }
}

impl KnowledgeStore for SqliteStore {
    fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Ok(());
        }

        let busy = self.config.busy_timeout_ms;
        let mut ddl = create_connection(&self.config.ddl_path(), busy)?;
        let schema_version = run_migrations(&mut ddl)?;
        let pool = ConnectionPool::new(&self.config.crud_path(), self.config.pool_size, busy)?;

        info!(
            path = %self.config.crud_path(),
            account = %self.account_id,
            schema_version,
            pool_size = pool.size(),
            "sqlite store opened"
        );
        *state = Some(Handles {
            _ddl: Mutex::new(ddl),
            pool,
            schema_version,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.take().is_none() {
            return Err(KnowledgeError::NotOpen(BACKEND));
        }
        debug!(account = %self.account_id, "sqlite store closed");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Every write is committed as it happens
        self.with_pool(|_| Ok(()))
    }

    fn add_record(&self, mut record: Record) -> Result<Record> {
        require_id(&record.id)?;
        let account = self.account_id.as_str();

        let stored = self.with_pool(|pool| {
            pool.with_transaction(|conn| {
                if fetch(conn, account, &record.id)?.is_some() {
                    return Err(KnowledgeError::AlreadyExists(record.id.clone()));
                }
                let now = Utc::now();
                record.created_at.get_or_insert(now);
                record.updated_at.get_or_insert(now);
                insert(conn, account, &record, false)?;
                Ok(record)
            })
        })?;

        debug!(id = %stored.id, "record added");
        self.events.record(&StoreEvent::record_created(BACKEND, &stored.id));
        Ok(stored)
    }

    fn get_record(&self, id: &str) -> Result<Record> {
        let account = self.account_id.as_str();
        self.with_pool(|pool| {
            pool.with_connection(|conn| match fetch(conn, account, id)? {
                Some((record, false)) => Ok(record),
                _ => Err(KnowledgeError::NotFound(id.to_string())),
            })
        })
    }

    fn update_record(&self, mut record: Record) -> Result<Record> {
        require_id(&record.id)?;
        let account = self.account_id.as_str();

        let stored = self.with_pool(|pool| {
            pool.with_transaction(|conn| match fetch(conn, account, &record.id)? {
                Some((existing, false)) => {
                    if record.created_at.is_none() {
                        record.created_at = existing.created_at;
                    }
                    record.updated_at = Some(Utc::now());
                    update_row(conn, account, &record)?;
                    Ok(record)
                }
                _ => Err(KnowledgeError::NotFound(record.id.clone())),
            })
        })?;

        debug!(id = %stored.id, "record updated");
        self.events.record(&StoreEvent::record_updated(BACKEND, &stored.id));
        Ok(stored)
    }

    fn delete_record(&self, id: &str) -> Result<()> {
        self.move_partition(id, true)?;
        debug!(id, "record deleted");
        self.events.record(&StoreEvent::record_deleted(BACKEND, id));
        Ok(())
    }

    fn restore_record(&self, id: &str) -> Result<()> {
        self.move_partition(id, false)?;
        debug!(id, "record restored");
        self.events.record(&StoreEvent::record_restored(BACKEND, id));
        Ok(())
    }

    fn purge_record(&self, id: &str) -> Result<()> {
        let account = self.account_id.as_str();
        self.with_pool(|pool| {
            pool.with_connection(|conn| {
                let removed = conn.execute(
                    "DELETE FROM knowledge_entry WHERE account_id = ?1 AND id = ?2",
                    params![account, id],
                )?;
                if removed == 0 {
                    return Err(KnowledgeError::NotFound(id.to_string()));
                }
                Ok(())
            })
        })?;

        debug!(id, "record purged");
        self.events.record(&StoreEvent::record_purged(BACKEND, id));
        Ok(())
    }

    fn search_records(&self, filter: &Filter) -> Result<Vec<Record>> {
        let query = SqlBuilder::new().build_search(filter, &self.account_id);
        debug!(sql = %query.sql, "search");

        let mut hits = self.with_pool(|pool| {
            pool.with_connection(|conn| {
                let mut stmt = conn.prepare(&query.sql)?;
                let param_refs: Vec<&dyn ToSql> = query.params.iter().map(|p| p.as_ref()).collect();
                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    row_to_record(row).map(|(record, _)| record)
                })?;
                let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
        })?;

        if query.sort_in_process {
            evaluate::sort_records(&mut hits, filter.order_by.as_deref(), filter.order_dir);
            hits = evaluate::paginate(hits, filter.offset, filter.limit);
        }

        debug!(hits = hits.len(), "search executed");
        self.events.record(&StoreEvent::search_executed(BACKEND, hits.len()));
        Ok(hits)
    }

    fn load_records(&self, records: Vec<Record>) -> Result<LoadSummary> {
        validate_batch(&records)?;
        let account = self.account_id.as_str();

        let summary = self.with_pool(|pool| {
            pool.with_transaction(|conn| {
                let now = Utc::now();
                let mut summary = LoadSummary::default();

                for (index, mut record) in records.into_iter().enumerate() {
                    let id = record.id.clone();
                    let step = || -> Result<()> {
                        match fetch(conn, account, &record.id)? {
                            Some((stored, _)) => match merge_loaded(&stored, record, now) {
                                Some(merged) => {
                                    update_row(conn, account, &merged)?;
                                    summary.updated += 1;
                                }
                                None => summary.unchanged += 1,
                            },
                            None => {
                                record.created_at.get_or_insert(now);
                                record.updated_at.get_or_insert(now);
                                insert(conn, account, &record, false)?;
                                summary.inserted += 1;
                            }
                        }
                        Ok(())
                    };
                    step().map_err(|e| e.in_batch(index, &id))?;
                }
                Ok(summary)
            })
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
        let mut info = StoreInfo::new(BACKEND, true)
            .with_detail("account_id", &self.account_id)
            .with_detail("database", self.config.crud_path())
            .with_detail("pool_size", self.config.pool_size);

        if let Some(handles) = state.as_ref() {
            let (live, deleted) = handles.pool.with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(SUM(is_deleted = 0), 0), COALESCE(SUM(is_deleted = 1), 0)
                     FROM knowledge_entry WHERE account_id = ?1",
                    [&self.account_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?)
            })?;
            info.open = true;
            info.record_count = live as usize;
            info.deleted_count = deleted as usize;
            info = info.with_detail("schema_version", handles.schema_version);
        }
        Ok(info)
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

impl SqliteStore {
    /// Flip `is_deleted`, enforcing the lifecycle
    fn move_partition(&self, id: &str, delete: bool) -> Result<()> {
        let account = self.account_id.as_str();
        self.with_pool(|pool| {
            pool.with_transaction(|conn| match fetch(conn, account, id)? {
                Some((_, is_deleted)) if is_deleted != delete => {
                    conn.execute(
                        "UPDATE knowledge_entry SET is_deleted = ?1, updated_at = ?2
                         WHERE account_id = ?3 AND id = ?4",
                        params![delete, format_time(&Utc::now()), account, id],
                    )?;
                    Ok(())
                }
                Some(_) if delete => Err(KnowledgeError::InvalidStateTransition(format!(
                    "record {} is already deleted",
                    id
                ))),
                Some(_) => Err(KnowledgeError::InvalidStateTransition(format!(
                    "record {} is not deleted",
                    id
                ))),
                None => Err(KnowledgeError::NotFound(id.to_string())),
            })
        })
    }
}

fn require_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(KnowledgeError::InvalidArgument(
            "record ID must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Load a record of either partition, with its deleted flag
fn fetch(conn: &Connection, account: &str, id: &str) -> Result<Option<(Record, bool)>> {
    let sql = format!(
        "SELECT {} FROM knowledge_entry k WHERE k.account_id = ?1 AND k.id = ?2",
        SELECT_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![account, id], row_to_record)
        .optional()?)
}

fn insert(conn: &Connection, account: &str, record: &Record, is_deleted: bool) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge_entry (
            account_id, id, category, content_type, content, importance,
            created_at, updated_at, expires_at, source_id, source_type,
            owner_id, owner_type, subject_ids, subject_type, tags, refs,
            metadata, is_deleted
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            account,
            record.id,
            record.category.as_str(),
            record.content_type,
            record.content,
            record.importance,
            record.created_at.as_ref().map(format_time).unwrap_or_default(),
            record.updated_at.as_ref().map(format_time).unwrap_or_default(),
            record.expires_at.as_ref().map(format_time),
            record.source_id,
            record.source_type,
            record.owner_id,
            record.owner_type,
            serde_json::to_string(&record.subject_ids)?,
            record.subject_type,
            serde_json::to_string(&record.tags)?,
            serde_json::to_string(&record.references)?,
            serde_json::to_string(&record.metadata)?,
            is_deleted,
        ],
    )?;
    Ok(())
}

/// Overwrite every column except the partition flag
fn update_row(conn: &Connection, account: &str, record: &Record) -> Result<()> {
    conn.execute(
        "UPDATE knowledge_entry SET
            category = ?3, content_type = ?4, content = ?5, importance = ?6,
            created_at = ?7, updated_at = ?8, expires_at = ?9, source_id = ?10,
            source_type = ?11, owner_id = ?12, owner_type = ?13, subject_ids = ?14,
            subject_type = ?15, tags = ?16, refs = ?17, metadata = ?18
         WHERE account_id = ?1 AND id = ?2",
        params![
            account,
            record.id,
            record.category.as_str(),
            record.content_type,
            record.content,
            record.importance,
            record.created_at.as_ref().map(format_time).unwrap_or_default(),
            record.updated_at.as_ref().map(format_time).unwrap_or_default(),
            record.expires_at.as_ref().map(format_time),
            record.source_id,
            record.source_type,
            record.owner_id,
            record.owner_type,
            serde_json::to_string(&record.subject_ids)?,
            record.subject_type,
            serde_json::to_string(&record.tags)?,
            serde_json::to_string(&record.references)?,
            serde_json::to_string(&record.metadata)?,
        ],
    )?;
    Ok(())
}

/// Map a row selected with [`SELECT_COLUMNS`]
fn row_to_record(row: &Row) -> rusqlite::Result<(Record, bool)> {
    let category: String = row.get(1)?;
    let category = category
        .parse::<Category>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;

    let record = Record {
        id: row.get(0)?,
        category,
        content_type: row.get(2)?,
        content: row.get(3)?,
        importance: row.get(4)?,
        created_at: parse_time(row, 5)?,
        updated_at: parse_time(row, 6)?,
        expires_at: parse_time(row, 7)?,
        source_id: row.get(8)?,
        source_type: row.get(9)?,
        owner_id: row.get(10)?,
        owner_type: row.get(11)?,
        subject_ids: parse_json(row, 12)?,
        subject_type: row.get(13)?,
        tags: parse_json(row, 14)?,
        references: parse_json(row, 15)?,
        metadata: parse_json(row, 16)?,
    };
    let is_deleted: bool = row.get(17)?;
    Ok((record, is_deleted))
}

fn parse_time(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
