//! Persistent cycle journal using redb.
//!
//! # Table design
//!
//! A single `CYCLES` table keyed by a 24-byte composite:
//! ```text
//! [ created_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//!
//! Big-endian timestamps make byte order equal creation order, so the newest
//! cycles are a reverse scan away. Values are JSON-encoded [`CycleRecord`]s.
//! A record is rewritten in place under the same key on every phase change.

use std::fmt::Display;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, UpkeepError};

use super::record::{CycleRecord, CycleStatus};

const CYCLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("cycles");

fn cycle_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn journal_err(e: impl Display) -> UpkeepError {
    UpkeepError::Journal(e.to_string())
}

pub struct CycleJournal {
    db: Database,
}

impl CycleJournal {
    /// Open or create the journal at `path`.
    ///
    /// redb holds an exclusive file lock, so only one handle per host can be
    /// open at a time. The orchestrator opens the journal per cycle.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(journal_err)?;
        let wt = db.begin_write().map_err(journal_err)?;
        wt.open_table(CYCLES).map_err(journal_err)?;
        wt.commit().map_err(journal_err)?;
        Ok(Self { db })
    }

    /// Insert or overwrite `record`.
    pub fn put(&self, record: &CycleRecord) -> Result<()> {
        let key = cycle_key(record.created_at, record.id);
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(journal_err)?;
        {
            let mut table = wt.open_table(CYCLES).map_err(journal_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(journal_err)?;
        }
        wt.commit().map_err(journal_err)?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<CycleRecord>> {
        Ok(self.scan()?.into_iter().find(|r| r.id == id))
    }

    /// Up to `limit` records, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let rt = self.db.begin_read().map_err(journal_err)?;
        let table = rt.open_table(CYCLES).map_err(journal_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(journal_err)?.rev().take(limit) {
            let (_, v) = entry.map_err(journal_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Cycles that never reached a terminal status.
    pub fn in_progress(&self) -> Result<Vec<CycleRecord>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(CycleRecord::is_in_progress)
            .collect())
    }

    pub fn mark_interrupted(&self, id: Uuid) -> Result<()> {
        let mut record = self
            .get(id)?
            .ok_or_else(|| UpkeepError::Journal(format!("cycle not found: {id}")))?;
        record.status = CycleStatus::Interrupted;
        record.updated_at = Utc::now();
        self.put(&record)
    }

    /// Delete the oldest finished records so at most `keep` remain. Records
    /// still in progress are never deleted. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let rt = self.db.begin_read().map_err(journal_err)?;
        let table = rt.open_table(CYCLES).map_err(journal_err)?;
        let mut total: usize = 0;
        let mut finished = Vec::new();
        for entry in table.iter().map_err(journal_err)? {
            let (k, v) = entry.map_err(journal_err)?;
            total += 1;
            let record: CycleRecord = serde_json::from_slice(v.value())?;
            if !record.is_in_progress() {
                finished.push(k.value().to_vec());
            }
        }
        drop(table);
        drop(rt);

        let excess = total.saturating_sub(keep).min(finished.len());
        if excess == 0 {
            return Ok(0);
        }
        let wt = self.db.begin_write().map_err(journal_err)?;
        {
            let mut table = wt.open_table(CYCLES).map_err(journal_err)?;
            for key in &finished[..excess] {
                table.remove(key.as_slice()).map_err(journal_err)?;
            }
        }
        wt.commit().map_err(journal_err)?;
        Ok(excess)
    }

    /// All records in creation order.
    fn scan(&self) -> Result<Vec<CycleRecord>> {
        let rt = self.db.begin_read().map_err(journal_err)?;
        let table = rt.open_table(CYCLES).map_err(journal_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(journal_err)? {
            let (_, v) = entry.map_err(journal_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::record::{CyclePhase, Trigger};
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, CycleJournal) {
        let dir = TempDir::new().unwrap();
        let journal = CycleJournal::open(&dir.path().join(".upkeep/journal.redb")).unwrap();
        (dir, journal)
    }

    fn record_at(ts: DateTime<Utc>) -> CycleRecord {
        let mut record = CycleRecord::new(Uuid::new_v4(), Trigger::Timer);
        record.created_at = ts;
        record.updated_at = ts;
        record
    }

    #[test]
    fn put_overwrites_same_cycle() {
        let (_dir, journal) = open_tmp();
        let mut record = record_at(Utc::now());
        journal.put(&record).unwrap();
        record.phase = CyclePhase::Restarting;
        record.service_stopped = true;
        journal.put(&record).unwrap();

        let all = journal.list_recent(10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].phase, CyclePhase::Restarting);
        assert!(all[0].service_stopped);
    }

    #[test]
    fn list_recent_is_newest_first_and_limited() {
        let (_dir, journal) = open_tmp();
        let now = Utc::now();
        let old = record_at(now - CDur::minutes(20));
        let mid = record_at(now - CDur::minutes(10));
        let new = record_at(now);
        journal.put(&mid).unwrap();
        journal.put(&new).unwrap();
        journal.put(&old).unwrap();

        let recent = journal.list_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, new.id);
        assert_eq!(recent[1].id, mid.id);
    }

    #[test]
    fn interrupted_cycles_leave_in_progress() {
        let (_dir, journal) = open_tmp();
        let running = record_at(Utc::now());
        let mut done = record_at(Utc::now() - CDur::minutes(1));
        done.status = CycleStatus::Completed {
            outcome: "up to date".into(),
        };
        journal.put(&running).unwrap();
        journal.put(&done).unwrap();

        let stuck = journal.in_progress().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, running.id);

        journal.mark_interrupted(running.id).unwrap();
        assert!(journal.in_progress().unwrap().is_empty());
        let stored = journal.get(running.id).unwrap().unwrap();
        assert_eq!(stored.status, CycleStatus::Interrupted);
    }

    #[test]
    fn mark_interrupted_unknown_id_is_error() {
        let (_dir, journal) = open_tmp();
        let err = journal.mark_interrupted(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, UpkeepError::Journal(_)));
    }

    #[test]
    fn prune_keeps_newest_and_never_drops_running_cycles() {
        let (_dir, journal) = open_tmp();
        let now = Utc::now();
        let stuck = record_at(now - CDur::minutes(60));
        journal.put(&stuck).unwrap();
        let mut finished = Vec::new();
        for i in (0..5).rev() {
            let mut record = record_at(now - CDur::minutes(i));
            record.status = CycleStatus::Completed {
                outcome: "up to date".into(),
            };
            journal.put(&record).unwrap();
            finished.push(record.id);
        }

        assert_eq!(journal.prune(3).unwrap(), 3);
        let left: Vec<Uuid> = journal.list_recent(10).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(left, vec![finished[4], finished[3], stuck.id]);
        assert_eq!(journal.prune(3).unwrap(), 0);
    }

    #[test]
    fn reopening_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.redb");
        let record = record_at(Utc::now());
        {
            let journal = CycleJournal::open(&path).unwrap();
            journal.put(&record).unwrap();
        }
        let journal = CycleJournal::open(&path).unwrap();
        assert_eq!(journal.get(record.id).unwrap().unwrap().id, record.id);
    }
}
