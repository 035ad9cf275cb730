//! SQLite-backed key-value store: one `kv` table, WAL mode, mutex-guarded
//! connection.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use keel_core::errors::KeelResult;
use keel_core::traits::KeyValueBackend;

use crate::to_store_err;

/// Durable backend over a single SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open a backend backed by a file on disk.
    pub fn open(path: &Path) -> KeelResult<Self> {
        let conn = Connection::open(path).map_err(|e| to_store_err(e.to_string()))?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory backend (for testing).
    pub fn open_in_memory() -> KeelResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| to_store_err(e.to_string()))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> KeelResult<T>
    where
        F: FnOnce(&Connection) -> KeelResult<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|e| to_store_err(format!("connection lock poisoned: {e}")))?;
        f(&guard)
    }
}

/// Apply performance and safety pragmas to a file-backed connection.
fn apply_pragmas(conn: &Connection) -> KeelResult<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        ",
    )
    .map_err(|e| to_store_err(e.to_string()))?;
    Ok(())
}

fn migrate(conn: &Connection) -> KeelResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| to_store_err(e.to_string()))?;
    Ok(())
}

impl KeyValueBackend for SqliteBackend {
    fn get(&self, key: &str) -> KeelResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| to_store_err(e.to_string()))
        })
    }

    fn put(&self, key: &str, value: &str) -> KeelResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| to_store_err(e.to_string()))?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> KeelResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(|e| to_store_err(e.to_string()))?;
            Ok(())
        })
    }

    fn list_all(&self) -> KeelResult<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv ORDER BY key")
                .map_err(|e| to_store_err(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| to_store_err(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| to_store_err(e.to_string()))?);
            }
            Ok(out)
        })
    }
}
