//! Durable, deduplicated quote store.
//!
//! SQLite-backed sink for coalesced minute records. The composite primary
//! key makes inserts idempotent: a record that already exists is a silent
//! no-op (`INSERT OR IGNORE`), which is the only synchronization point the
//! two concurrent feed pipelines rely on.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::CoalescedRecord;

/// Pragmas applied once per connection. WAL keeps concurrent readers cheap
/// while the two pipelines write.
const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// Key collision: the record was already stored. Success, not an error.
    AlreadyPresent,
}

/// Handle to the per-exchange tick table.
///
/// The connection is shared behind a mutex; writes are short single-row
/// statements so contention between the two pipelines is negligible.
#[derive(Clone)]
pub struct QuoteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl QuoteStore {
    /// Open (or create) the store file and provision the tick table.
    pub fn open(db_path: &str, exchange: &str) -> Result<Self> {
        let table = table_name(exchange)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        Self::init(conn, table, db_path)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(exchange: &str) -> Result<Self> {
        let table = table_name(exchange)?;
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, table, ":memory:")
    }

    fn init(conn: Connection, table: String, db_path: &str) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to apply database pragmas")?;

        // Primary key spans the full tuple so duplicate coalesced records
        // collapse to one row regardless of which pipeline wrote first.
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                timestamp INTEGER NOT NULL,
                instrument_name TEXT NOT NULL,
                bid_price REAL NOT NULL,
                bid_amount REAL NOT NULL,
                ask_price REAL NOT NULL,
                ask_amount REAL NOT NULL,
                PRIMARY KEY(timestamp, instrument_name, bid_price, bid_amount,
                            ask_price, ask_amount)
            );
            "#
        ))
        .with_context(|| format!("Failed to create table {}", table))?;

        let existing: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        info!(db = db_path, table = %table, rows = existing, "quote store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    /// Insert a record unless the full key tuple is already present.
    pub fn insert_if_absent(&self, record: &CoalescedRecord) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                &format!("INSERT OR IGNORE INTO {} VALUES (?,?,?,?,?,?)", self.table),
                params![
                    record.bucket_start,
                    record.instrument,
                    record.bid_price,
                    record.bid_amount,
                    record.ask_price,
                    record.ask_amount,
                ],
            )
            .with_context(|| format!("Insert into {} failed", self.table))?;

        Ok(if changed == 0 {
            WriteOutcome::AlreadyPresent
        } else {
            WriteOutcome::Inserted
        })
    }

    pub fn row_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("Count on {} failed", self.table))?;
        Ok(count)
    }

    /// Rows stored for one minute bucket, for tests and sanity checks.
    pub fn rows_for_bucket(&self, bucket_start: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE timestamp = ?", self.table),
                params![bucket_start],
                |row| row.get(0),
            )
            .with_context(|| format!("Bucket count on {} failed", self.table))?;
        Ok(count)
    }
}

/// A write failure worth retrying: the database is briefly busy or locked.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(rusqlite::Error::SqliteFailure(e, _)) = cause.downcast_ref::<rusqlite::Error>()
        {
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return true;
            }
        }
    }
    false
}

fn table_name(exchange: &str) -> Result<String> {
    // The exchange id is interpolated into SQL; keep it to identifier chars.
    if exchange.is_empty()
        || !exchange
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        warn!(exchange, "rejecting exchange id for table name");
        bail!("exchange id must be non-empty and alphanumeric: {:?}", exchange);
    }
    Ok(format!("{}_ticks", exchange))
}
