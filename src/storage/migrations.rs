//! Database migrations for the SQLite knowledge store

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{KnowledgeError, Result};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Record table
pub const TABLE_ENTRY: &str = "knowledge_entry";

/// Applied migrations
pub const TABLE_SCHEMA_VERSION: &str = "knowledge_schema_version";

/// Columns the store reads and writes
pub const REQUIRED_COLUMNS: &[&str] = &[
    "account_id",
    "id",
    "category",
    "content_type",
    "content",
    "importance",
    "created_at",
    "updated_at",
    "expires_at",
    "source_id",
    "source_type",
    "owner_id",
    "owner_type",
    "subject_ids",
    "subject_type",
    "tags",
    "refs",
    "metadata",
    "is_deleted",
];

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial knowledge_entry table",
        sql: r#"
        CREATE TABLE IF NOT EXISTS knowledge_entry (
            account_id TEXT NOT NULL,
            id TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'fact',
            content_type TEXT NOT NULL DEFAULT '',
            content BLOB NOT NULL DEFAULT x'',
            importance INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL DEFAULT '',
            expires_at TEXT,
            source_id TEXT NOT NULL DEFAULT '',
            source_type TEXT NOT NULL DEFAULT '',
            owner_id TEXT NOT NULL DEFAULT '',
            owner_type TEXT NOT NULL DEFAULT '',
            subject_ids TEXT NOT NULL DEFAULT '[]',
            subject_type TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            refs TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, id)
        );

        CREATE INDEX IF NOT EXISTS knowledge_entry_deleted_idx
            ON knowledge_entry(account_id, is_deleted);
        CREATE INDEX IF NOT EXISTS knowledge_entry_category_idx
            ON knowledge_entry(account_id, category);
        "#,
    },
    Migration {
        version: 2,
        description: "Indexes for time ordering and expiry",
        sql: r#"
        CREATE INDEX IF NOT EXISTS knowledge_entry_updated_idx
            ON knowledge_entry(account_id, updated_at);
        CREATE INDEX IF NOT EXISTS knowledge_entry_expires_idx
            ON knowledge_entry(expires_at) WHERE expires_at IS NOT NULL;
        "#,
    },
];

/// Latest migration version known by this build
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Run all pending migrations, then validate the resulting schema
pub fn run_migrations(conn: &mut Connection) -> Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;

    let current = current_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(KnowledgeError::SchemaIncompatible(format!(
            "database schema version {} is newer than supported version {}",
            current, latest
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration).map_err(|e| KnowledgeError::Migration {
            version: migration.version,
            source: Box::new(e),
        })?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
    }

    validate_schema(conn)
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO knowledge_schema_version (version, description, applied_at)
         VALUES (?1, ?2, ?3)",
        params![migration.version, migration.description, Utc::now().to_rfc3339()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Highest applied version, 0 for a fresh database
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row(
            "SELECT MAX(version) FROM knowledge_schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Check the version and the columns this build relies on
pub fn validate_schema(conn: &Connection) -> Result<u32> {
    let version = current_version(conn)?;
    if version != SCHEMA_VERSION {
        return Err(KnowledgeError::SchemaIncompatible(format!(
            "database schema version {} does not match required version {}",
            version, SCHEMA_VERSION
        )));
    }

    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns: Vec<String> = stmt
        .query_map([TABLE_ENTRY], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if !missing.is_empty() {
        return Err(KnowledgeError::SchemaIncompatible(format!(
            "{} is missing columns: {}",
            TABLE_ENTRY,
            missing.join(", ")
        )));
    }

    Ok(version)
}
