//! SQLite plumbing shared by the stores.
//!
//! Every store owns one connection behind a mutex. Stores may point at the
//! same database file; SQLite's busy timeout bounds lock waits.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::consts::SQLITE_BUSY_TIMEOUT;
use crate::error::{Error, Result};

pub(crate) fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;
    Ok(conn)
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::StorageUnavailable("connection lock poisoned".to_string()))
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {value:?}: {e}")))
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Storage(format!("bad id {value:?}: {e}")))
}
