//! Read access to the application's recorded collections.
//!
//! The `collections` table belongs to the served application, which creates
//! and fills it. The updater only reads it and must never delete or recreate
//! the database during a code or asset swap.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Schema the application creates. Idempotent, safe to ship as a migration.
pub const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    start_s REAL,
    end_s REAL,
    description TEXT,
    uploaded INTEGER NOT NULL DEFAULT 0
);";

/// A named time range of recorded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: i64,
    pub name: String,
    pub start_s: Option<f64>,
    pub end_s: Option<f64>,
    pub description: Option<String>,
    pub uploaded: bool,
}

impl CollectionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            start_s: row.get(2)?,
            end_s: row.get(3)?,
            description: row.get(4)?,
            uploaded: row.get::<_, i64>(5)? != 0,
        })
    }
}

pub struct CollectionStore {
    conn: Connection,
}

impl CollectionStore {
    /// Open an existing database read-only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    fn table_exists(&self) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'collections'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All collections, newest start first. Empty when the application has
    /// not created the table yet.
    pub fn list(&self) -> Result<Vec<CollectionRecord>> {
        if !self.table_exists()? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT id, name, start_s, end_s, description, uploaded
             FROM collections
             ORDER BY start_s DESC, id DESC",
        )?;
        let rows = stmt.query_map([], CollectionRecord::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Seeding and lookups for tests. Writes in production come from the
/// application itself.
#[cfg(test)]
impl CollectionStore {
    /// Open (creating if needed) with the application schema in place.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn get(&self, id: i64) -> Result<Option<CollectionRecord>> {
        if !self.table_exists()? {
            return Ok(None);
        }
        let record = self
            .conn
            .query_row(
                "SELECT id, name, start_s, end_s, description, uploaded
                 FROM collections WHERE id = ?1",
                rusqlite::params![id],
                CollectionRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn insert(&self, name: &str, start_s: f64, description: Option<&str>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO collections (name, start_s, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, start_s, description],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count(&self) -> Result<usize> {
        if !self.table_exists()? {
            return Ok(0);
        }
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
