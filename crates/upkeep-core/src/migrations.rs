//! Application database migrations shipped with the source tree.
//!
//! After a pull, every `*.sql` file in the migrations directory is executed
//! in file-name order against the application database. Scripts are expected
//! to be idempotent; they run on every update.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    /// `(script, error)` pairs.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    db_path: PathBuf,
    scripts_dir: PathBuf,
}

impl MigrationPlan {
    pub fn new(db_path: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Sorted list of scripts. A missing directory yields an empty list.
    pub fn scripts(&self) -> Result<Vec<PathBuf>> {
        if !self.scripts_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut scripts: Vec<PathBuf> = fs::read_dir(&self.scripts_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
            .collect();
        scripts.sort();
        Ok(scripts)
    }

    /// Run every script. One failing script does not stop the rest.
    pub fn apply(&self) -> Result<MigrationReport> {
        let scripts = self.scripts()?;
        let mut report = MigrationReport::default();
        if scripts.is_empty() {
            return Ok(report);
        }

        let conn = Connection::open(&self.db_path)?;
        for script in scripts {
            let name = script_name(&script);
            let outcome = fs::read_to_string(&script)
                .map_err(|e| e.to_string())
                .and_then(|sql| conn.execute_batch(&sql).map_err(|e| e.to_string()));
            match outcome {
                Ok(()) => {
                    info!(script = %name, "migration applied");
                    report.applied.push(name);
                }
                Err(e) => {
                    warn!(script = %name, error = %e, "migration failed; continuing");
                    report.failed.push((name, e));
                }
            }
        }
        Ok(report)
    }
}

fn script_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{CollectionStore, SCHEMA};
    use tempfile::TempDir;

    #[test]
    fn missing_scripts_dir_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let plan = MigrationPlan::new(dir.path().join("storage.db"), dir.path().join("sql"));
        let report = plan.apply().unwrap();
        assert!(report.applied.is_empty());
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert!(!dir.path().join("storage.db").exists());
    }

    #[test]
    fn rerunning_migrations_keeps_existing_rows() {
        let dir = TempDir::new().unwrap();
        let sql = dir.path().join("sql");
        fs::create_dir_all(&sql).unwrap();
        fs::write(sql.join("001_collections.sql"), SCHEMA).unwrap();
        fs::write(
            sql.join("002_index.sql"),
            "CREATE INDEX IF NOT EXISTS idx_start ON collections(start_s);",
        )
        .unwrap();
        let db = dir.path().join("storage.db");
        let plan = MigrationPlan::new(&db, &sql);

        plan.apply().unwrap();
        CollectionStore::open(&db)
            .unwrap()
            .insert("session-1", 10.0, None)
            .unwrap();
        let report = plan.apply().unwrap();

        assert_eq!(report.applied, vec!["001_collections.sql", "002_index.sql"]);
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        let rows = CollectionStore::open_read_only(&db).unwrap().list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "session-1");
    }

    #[test]
    fn failing_script_does_not_block_later_ones() {
        let dir = TempDir::new().unwrap();
        let sql = dir.path().join("sql");
        fs::create_dir_all(&sql).unwrap();
        fs::write(sql.join("001_bad.sql"), "THIS IS NOT SQL;").unwrap();
        fs::write(sql.join("002_schema.sql"), SCHEMA).unwrap();
        fs::write(sql.join("notes.txt"), "ignored").unwrap();

        let db = dir.path().join("storage.db");
        let report = MigrationPlan::new(&db, &sql).apply().unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "001_bad.sql");
        assert_eq!(report.applied, vec!["002_schema.sql"]);
        assert_eq!(CollectionStore::open_read_only(&db).unwrap().count().unwrap(), 0);
    }
}
