//! Record store behind the orchestrator: in-memory or SQLite.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::job::{JobRecord, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run {0} already exists")]
    Duplicate(String),
    #[error("checksum mismatch for run {run_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },
}

/// Persistence boundary for job records.
///
/// `update` is a conditional write: it only lands when the incoming record's
/// `revision` is greater than the stored one, so late heartbeats from a
/// superseded writer can never overwrite a terminal state.
pub trait JobStore: Send + Sync {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    fn update(&self, record: &JobRecord) -> Result<bool, StoreError>;

    fn get(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Newest first.
    fn most_recent(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError>;

    fn delete(&self, run_id: &str) -> Result<bool, StoreError>;

    /// QUEUED and RUNNING records, oldest first.
    fn unfinished(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Terminal runs that finished before `cutoff_ms`.
    fn expired(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, (u64, JobRecord)>,
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.records.contains_key(&record.run_id) {
            return Err(StoreError::Duplicate(record.run_id.clone()));
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state
            .records
            .insert(record.run_id.clone(), (sequence, record.clone()));
        Ok(())
    }

    fn update(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.records.get_mut(&record.run_id) {
            Some((_, stored)) if stored.revision < record.revision => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .records
            .get(run_id)
            .map(|(_, record)| record.clone()))
    }

    fn most_recent(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<&(u64, JobRecord)> = state.records.values().collect();
        rows.sort_by(|a, b| {
            b.1.created_at_ms
                .cmp(&a.1.created_at_ms)
                .then(b.0.cmp(&a.0))
        });
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().records.remove(run_id).is_some())
    }

    fn unfinished(&self) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<&(u64, JobRecord)> = state
            .records
            .values()
            .filter(|(_, record)| !record.status.is_terminal())
            .collect();
        rows.sort_by_key(|(sequence, record)| (record.created_at_ms, *sequence));
        Ok(rows.into_iter().map(|(_, record)| record.clone()).collect())
    }

    fn expired(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .records
            .values()
            .filter(|(_, record)| record.status.is_terminal())
            .filter(|(_, record)| record.finished_at_ms.is_some_and(|at| at < cutoff_ms))
            .map(|(_, record)| record.run_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        ensure_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ensure_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS job_runs (
             seq            INTEGER PRIMARY KEY AUTOINCREMENT,
             run_id         TEXT    NOT NULL UNIQUE,
             kind           TEXT    NOT NULL,
             status         TEXT    NOT NULL,
             created_at_ms  INTEGER NOT NULL,
             finished_at_ms INTEGER,
             revision       INTEGER NOT NULL,
             record_json    TEXT    NOT NULL,
             checksum       TEXT    NOT NULL
         );
         CREATE INDEX IF NOT EXISTS job_runs_status ON job_runs (status);",
    )?;
    Ok(())
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn revision_param(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

fn decode(run_id: &str, json: &str, stored_checksum: &str) -> Result<JobRecord, StoreError> {
    let actual = sha256_hex(json);
    if actual != stored_checksum {
        return Err(StoreError::ChecksumMismatch {
            run_id: run_id.to_string(),
            expected: stored_checksum.to_string(),
            actual,
        });
    }
    Ok(serde_json::from_str(json)?)
}

impl SqliteJobStore {
    fn query_records(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (run_id, json, checksum) = row?;
            records.push(decode(&run_id, &json, &checksum)?);
        }
        Ok(records)
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let checksum = sha256_hex(&json);
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO job_runs
                 (run_id, kind, status, created_at_ms, finished_at_ms, revision, record_json, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.run_id,
                record.kind.as_str(),
                record.status.as_str(),
                record.created_at_ms,
                record.finished_at_ms,
                revision_param(record.revision),
                json,
                checksum
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(record.run_id.clone()));
        }
        Ok(())
    }

    fn update(&self, record: &JobRecord) -> Result<bool, StoreError> {
        let json = serde_json::to_string(record)?;
        let checksum = sha256_hex(&json);
        let changed = self.conn.lock().execute(
            "UPDATE job_runs
                SET status = ?2, finished_at_ms = ?3, revision = ?4, record_json = ?5, checksum = ?6
              WHERE run_id = ?1 AND revision < ?4",
            params![
                record.run_id,
                record.status.as_str(),
                record.finished_at_ms,
                revision_param(record.revision),
                json,
                checksum
            ],
        )?;
        Ok(changed == 1)
    }

    fn get(&self, run_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT record_json, checksum FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(json, checksum)| decode(run_id, &json, &checksum))
            .transpose()
    }

    fn most_recent(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records(
            "SELECT run_id, record_json, checksum FROM job_runs
              ORDER BY created_at_ms DESC, seq DESC LIMIT ?1",
            &[&limit],
        )
    }

    fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM job_runs WHERE run_id = ?1", params![run_id])?;
        Ok(removed > 0)
    }

    fn unfinished(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query_records(
            "SELECT run_id, record_json, checksum FROM job_runs
              WHERE status IN (?1, ?2) ORDER BY created_at_ms ASC, seq ASC",
            &[&JobStatus::Queued.as_str(), &JobStatus::Running.as_str()],
        )
    }

    fn expired(&self, cutoff_ms: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id FROM job_runs
              WHERE status IN (?1, ?2, ?3) AND finished_at_ms < ?4 ORDER BY run_id",
        )?;
        let ids = stmt
            .query_map(
                params![
                    JobStatus::Completed.as_str(),
                    JobStatus::Failed.as_str(),
                    JobStatus::Aborted.as_str(),
                    cutoff_ms
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

/// SQLite when a path is configured and opens cleanly, memory otherwise.
pub fn open_store(path: Option<&Path>) -> Arc<dyn JobStore> {
    let Some(path) = path else {
        warn!("no job database configured; run records will not survive a restart");
        return Arc::new(MemoryJobStore::new());
    };

    match SqliteJobStore::open(path) {
        Ok(store) => {
            info!(path = %path.display(), "job store opened");
            Arc::new(store)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "job database unavailable; using in-memory store");
            Arc::new(MemoryJobStore::new())
        }
    }
}
