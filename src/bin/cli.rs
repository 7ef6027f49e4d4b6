//! kstore CLI
//!
//! Command-line interface for knowledge store administration.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kstore::error::{KnowledgeError, Result};
use kstore::events::{EventSink, NoopSink, TracingSink};
use kstore::storage::{parse_group, Filter, SortDirection};
use kstore::types::{Category, Record};
use kstore::{open_store, KnowledgeStore, SqlConfig, StoreConfig};

#[derive(Parser)]
#[command(name = "kstore")]
#[command(about = "Knowledge record store CLI")]
#[command(version)]
struct Cli {
    /// JSON file store path
    #[arg(long, env = "KSTORE_FILE", conflicts_with = "sqlite")]
    file: Option<String>,

    /// SQLite database path
    #[arg(long, env = "KSTORE_SQL_CRUD_CONN")]
    sqlite: Option<String>,

    /// Account UUID for the SQLite store
    #[arg(long, env = "KSTORE_ACCOUNT_ID")]
    account: Option<String>,

    /// Pooled SQLite connections
    #[arg(long, env = "KSTORE_SQL_MAX_CONNS", default_value = "4")]
    pool_size: usize,

    /// Log store events
    #[arg(long)]
    trace_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a record
    Add {
        /// Record ID
        id: String,
        /// Text content
        content: String,
        /// Category (fact, message, decision, action)
        #[arg(short, long, default_value = "fact")]
        category: String,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Importance (0-100)
        #[arg(short, long, default_value = "0")]
        importance: i32,
        /// Metadata entries as key=value (repeatable)
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },
    /// Get a live record by ID
    Get {
        /// Record ID
        id: String,
    },
    /// Soft-delete a record
    Delete {
        /// Record ID
        id: String,
    },
    /// Restore a deleted record
    Restore {
        /// Record ID
        id: String,
    },
    /// Permanently remove a record
    Purge {
        /// Record ID
        id: String,
    },
    /// Search records
    Search {
        /// Filter group as JSON
        #[arg(short, long)]
        filter: Option<String>,
        /// Maximum results (0 = unlimited)
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Results to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Sort field
        #[arg(long)]
        order_by: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Include deleted records
        #[arg(long)]
        include_deleted: bool,
        /// Only deleted records
        #[arg(long, conflicts_with = "include_deleted")]
        only_deleted: bool,
    },
    /// Load records from a JSON array file
    Load {
        /// Input file
        path: String,
    },
    /// Show store information
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = store_config(&cli)?;
    let sink: Arc<dyn EventSink> = if cli.trace_events {
        Arc::new(TracingSink)
    } else {
        Arc::new(NoopSink)
    };

    let store = open_store(&config, sink)?;
    let result = run(store.as_ref(), cli.command);
    // Persist even when the command failed
    let closed = store.close();
    result?;
    closed
}

fn store_config(cli: &Cli) -> Result<StoreConfig> {
    match (&cli.file, &cli.sqlite) {
        (Some(path), _) => Ok(StoreConfig::File { path: path.clone() }),
        (None, Some(path)) => {
            let account = cli.account.clone().ok_or_else(|| {
                KnowledgeError::Config("--account is required with --sqlite".to_string())
            })?;
            let mut sql = SqlConfig::new(path.clone(), account);
            sql.pool_size = cli.pool_size;
            Ok(StoreConfig::Sqlite(sql))
        }
        (None, None) => Err(KnowledgeError::Config(
            "choose a backend with --file or --sqlite".to_string(),
        )),
    }
}

fn run(store: &dyn KnowledgeStore, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            id,
            content,
            category,
            tags,
            importance,
            metadata,
        } => {
            let category: Category = category.parse().map_err(KnowledgeError::InvalidArgument)?;
            let tags: Vec<String> = tags
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();

            let mut record = Record::new(id, category)
                .with_text(content)
                .with_tags(tags)
                .with_importance(importance);
            for entry in metadata {
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    KnowledgeError::InvalidArgument(format!(
                        "metadata must be key=value, got {}",
                        entry
                    ))
                })?;
                record = record.with_metadata(key.trim(), value.trim());
            }

            let stored = store.add_record(record)?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }

        Commands::Get { id } => {
            let record = store.get_record(&id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Delete { id } => {
            store.delete_record(&id)?;
            println!("Deleted {}", id);
        }

        Commands::Restore { id } => {
            store.restore_record(&id)?;
            println!("Restored {}", id);
        }

        Commands::Purge { id } => {
            store.purge_record(&id)?;
            println!("Purged {}", id);
        }

        Commands::Search {
            filter,
            limit,
            offset,
            order_by,
            desc,
            include_deleted,
            only_deleted,
        } => {
            let root_group = match filter {
                Some(json) => parse_group(&serde_json::from_str(&json)?)?,
                None => Default::default(),
            };
            let mut query = Filter::new(root_group).limit(limit).offset(offset);
            if let Some(field) = order_by {
                let dir = if desc {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                };
                query = query.order_by(&field, dir);
            }
            query.include_deleted = include_deleted;
            query.only_deleted = only_deleted;

            let records = store.search_records(&query)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Commands::Load { path } => {
            let path = shellexpand::tilde(&path).into_owned();
            let raw = std::fs::read_to_string(&path)?;
            let records: Vec<Record> = serde_json::from_str(&raw)?;
            let summary = store.load_records(records)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Info => {
            let info = store.info()?;
            for (key, value) in info.to_map() {
                println!("{:<16} {}", key, value);
            }
        }
    }

    Ok(())
}
