//! SQLite connection management.
//!
//! The pool runs in WAL mode so polls can read while a pipeline stage is
//! writing, with `synchronous = NORMAL` (durable at checkpoint, which is
//! what WAL is designed for) and foreign keys enforced. The database file
//! and its parent directories are created on first use.
//!
//! `[db] busy_timeout_ms` is how long SQLite blocks on a locked database
//! before handing `SQLITE_BUSY` back; the store's retry loop takes it from
//! there.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::time::Duration;

use crate::config::{Config, DbConfig};

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db = &config.db;
    if let Some(parent) = db.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(connect_options(db))
        .await
        .with_context(|| format!("Failed to open database {}", db.path.display()))?;

    Ok(pool)
}

fn connect_options(db: &DbConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(&db.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(db.busy_timeout_ms))
}
