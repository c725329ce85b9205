//! Opaque database capability: load bytes, run SQL, return rows, close.
//!
//! The analysis engine only ever talks to [`DatabaseEngine`] and
//! [`DatabaseHandle`]; the SQLite implementation loads the export read-only
//! from memory so untrusted bytes never touch the filesystem.

#![allow(missing_docs)]

use rusqlite::{Connection, DatabaseName, params_from_iter};

pub use rusqlite::types::Value as SqlValue;

use crate::core::errors::{EmrtError, Result};

/// One result row, columns in select-list order.
pub type Row = Vec<SqlValue>;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const WRITE_VERSION_OFFSET: usize = 18;
const READ_VERSION_OFFSET: usize = 19;
const JOURNAL_WAL: u8 = 2;
const JOURNAL_LEGACY: u8 = 1;

/// An open database. Dropping without [`DatabaseHandle::close`] still releases
/// resources, but the engine always closes explicitly.
pub trait DatabaseHandle: Send {
    /// Run one statement with positional parameters and collect every row.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Release the handle.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for database handles.
pub trait DatabaseEngine: Send + Sync {
    /// Verify the engine can run at all. Called once per worker boot.
    fn initialize(&self) -> Result<()>;

    /// Load `bytes` as a database. Ownership of the buffer moves into the engine.
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn DatabaseHandle>>;
}

/// Bundled SQLite, deserialized read-only into an in-memory connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl DatabaseEngine for SqliteEngine {
    fn initialize(&self) -> Result<()> {
        let conn = Connection::open_in_memory().map_err(|e| EmrtError::EngineInit {
            details: e.to_string(),
        })?;
        let version: String = conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))
            .map_err(|e| EmrtError::EngineInit {
                details: e.to_string(),
            })?;
        if version.is_empty() {
            return Err(EmrtError::EngineInit {
                details: "sqlite reported an empty version".to_string(),
            });
        }
        Ok(())
    }

    fn open(&self, mut bytes: Vec<u8>) -> Result<Box<dyn DatabaseHandle>> {
        downgrade_wal_header(&mut bytes);
        let len = bytes.len();
        let mut conn = Connection::open_in_memory()?;
        conn.deserialize_read_exact(DatabaseName::Main, bytes.as_slice(), len, true)?;
        drop(bytes);
        Ok(Box::new(SqliteHandle { conn }))
    }
}

struct SqliteHandle {
    conn: Connection,
}

impl DatabaseHandle for SqliteHandle {
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|idx| row.get::<_, SqlValue>(idx))
                    .collect::<rusqlite::Result<Row>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err.into())
    }
}

/// Rewrite a WAL-mode header to rollback-journal mode in place.
///
/// A deserialized image has no `-wal` sidecar; SQLite refuses to read a
/// WAL-flagged main file from memory. Returns true when the header changed.
pub fn downgrade_wal_header(bytes: &mut [u8]) -> bool {
    if bytes.len() <= READ_VERSION_OFFSET || !bytes.starts_with(SQLITE_MAGIC) {
        return false;
    }
    let mut changed = false;
    for offset in [WRITE_VERSION_OFFSET, READ_VERSION_OFFSET] {
        if bytes[offset] == JOURNAL_WAL {
            bytes[offset] = JOURNAL_LEGACY;
            changed = true;
        }
    }
    changed
}

/// Serialize the main schema of `conn` to an owned byte image.
pub fn export_bytes(conn: &Connection) -> Result<Vec<u8>> {
    let data = conn.serialize(DatabaseName::Main)?;
    Ok(data.to_vec())
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
