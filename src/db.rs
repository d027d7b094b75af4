//! SQLite connection handling. One write connection per process, shared
//! behind an async mutex; every store clones the same handle so cross-table
//! operations can commit in a single transaction.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type DbHandle = Arc<Mutex<Connection>>;

/// Open (or create) the exchange database and apply pragmas.
pub fn open(db_path: &str) -> Result<DbHandle> {
    let conn = Connection::open(db_path).context("open exchange db")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("enable WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("enable foreign keys")?;
    Ok(Arc::new(Mutex::new(conn)))
}
