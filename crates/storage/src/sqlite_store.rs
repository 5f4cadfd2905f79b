use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backup_daemon_core::{Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::store::JobStore;
use crate::StorageError;

const MIGRATED_COLUMNS: [&str; 4] = ["blob_path", "creation_time", "storage_name", "databases"];

/// SQLite-backed job ledger. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self {
            db_path: db_path.into(),
        };
        if let Some(dir) = store.db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|err| {
                StorageError::io(format!("failed to create db dir {}", dir.display()), err)
            })?;
        }
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<(), StorageError> {
        let conn = connect(&self.db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                task_id TEXT PRIMARY KEY,
                type    TEXT,
                status  TEXT,
                vault   TEXT,
                err     TEXT
            );",
        )?;

        for column in MIGRATED_COLUMNS {
            match conn.execute(&format!("ALTER TABLE jobs ADD COLUMN {column} TEXT"), []) {
                Ok(_) => debug!(column, "added jobs column"),
                Err(err) if err.to_string().contains("duplicate column name") => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn connect(db_path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn upsert(&self, job: &Job) -> Result<(), StorageError> {
        let job = job.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&db_path)?;
            conn.execute(
                "INSERT INTO jobs (task_id, type, status, vault, err, storage_name, blob_path, databases, creation_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(task_id) DO UPDATE SET
                    type         = excluded.type,
                    status       = excluded.status,
                    vault        = excluded.vault,
                    err          = excluded.err,
                    storage_name = excluded.storage_name,
                    blob_path    = excluded.blob_path,
                    databases    = COALESCE(NULLIF(NULLIF(excluded.databases, ''), '[]'), jobs.databases)",
                params![
                    job.task_id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.vault,
                    job.err,
                    job.storage_name,
                    job.blob_path,
                    job.databases,
                    job.creation_time.unwrap_or_else(Utc::now).to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete_by_vault(&self, vault: &str) -> Result<usize, StorageError> {
        let vault = vault.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&db_path)?;
            let deleted = conn.execute("DELETE FROM jobs WHERE vault = ?1", [&vault])?;
            if deleted == 0 {
                return Err(StorageError::NoVaults(format!("in jobs for vault {vault}")));
            }
            Ok(deleted)
        })
        .await?
    }

    async fn select_by_task_id(&self, task_id: &str) -> Result<Job, StorageError> {
        let task_id = task_id.to_string();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT task_id, type, status, vault, err, storage_name, blob_path, databases, creation_time
                 FROM jobs WHERE task_id = ?1",
            )?;
            let found = stmt.query_row([&task_id], row_to_job).optional()?;
            found.ok_or(StorageError::JobNotFound(task_id))
        })
        .await?
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let text = |idx: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };
    Ok(Job {
        task_id: row.get(0)?,
        job_type: JobType::parse(&text(1)?).unwrap_or(JobType::Backup),
        status: JobStatus::parse(&text(2)?).unwrap_or(JobStatus::Queued),
        vault: text(3)?,
        err: text(4)?,
        storage_name: text(5)?,
        blob_path: text(6)?,
        databases: text(7)?,
        creation_time: parse_ts(&text(8)?),
    })
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
