//! Durable job history: jobs and their captured output in one `SQLite` file.
//!
//! ```text
//! <root>/.dagboard/
//!   history.db                              # jobs + job_logs
//!   history.db.corrupt-20260101T120000      # quarantined on a failed startup check
//! ```
//!
//! All access goes through a single connection behind a mutex, so every
//! statement is serialized. Timestamps are stored as Unix milliseconds.
//!
//! Callers that write or poll in a loop (output capture, live streams) go
//! through [`Storage::blocking`]. One-off reads from request handlers call
//! the store directly.

mod history;
mod job;
mod log;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use jiff::Timestamp;
use rusqlite::Connection;
use tracing::{info, warn};

/// How many jobs are kept when nothing else is configured.
pub const DEFAULT_RETENTION: usize = 500;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("job already finished: {0}")]
    JobFinished(String),

    #[error("exit code without a terminal status: {0}")]
    ExitWithoutFinish(String),

    #[error("integrity check failed: {0}")]
    Unhealthy(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, StorageError>;

/// The job store.
pub struct Storage {
    path: PathBuf,
    conn: Mutex<Connection>,
    retention: usize,
    recovered_from: Option<PathBuf>,
}

impl Storage {
    /// Opens the store at `path`, creating it if needed.
    ///
    /// A file that cannot be opened, fails `quick_check`, or cannot take the
    /// schema is renamed aside and replaced with an empty store. Only a
    /// failure of that fresh store is returned as an error.
    pub fn open(path: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let (conn, recovered_from) = match open_checked(&path) {
            Ok(conn) => (conn, None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "store failed startup check");
                let backup = quarantine(&path)?;
                let conn = open_checked(&path)?;
                info!(backup = %backup.display(), "started with a fresh store");
                (conn, Some(backup))
            }
        };

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            retention: retention.max(1),
            recovered_from,
        })
    }

    /// Returns the default store location under a project root.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(".dagboard").join("history.db")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous file was moved, if startup had to recover.
    pub fn recovered_from(&self) -> Option<&Path> {
        self.recovered_from.as_deref()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Closes the underlying connection.
    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| StorageError::from(e))
    }

    /// Runs `f` against the store on tokio's blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
    {
        let storage = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .unwrap_or_else(|e| Err(StorageError::Io(io::Error::other(e))))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opens a connection, verifies it, and applies the schema.
fn open_checked(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(2))?;

    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(StorageError::Unhealthy(verdict));
    }

    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          node_id TEXT NOT NULL,
          status TEXT NOT NULL,
          start_time INTEGER NOT NULL,
          end_time INTEGER,
          exit_code INTEGER,
          error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS job_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          timestamp INTEGER NOT NULL,
          stream TEXT NOT NULL,
          line TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_start_time ON jobs(start_time);
        CREATE INDEX IF NOT EXISTS idx_jobs_node_id ON jobs(node_id);
        CREATE INDEX IF NOT EXISTS idx_job_logs_job_id ON job_logs(job_id, id);
        ",
    )?;
    Ok(())
}

/// Moves an unhealthy store file (and its WAL siblings) aside.
///
/// Returns the new path of the main file. Nothing is deleted.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map_or_else(|| "history.db".to_string(), |n| n.to_string_lossy().into_owned());
    let stamp = Timestamp::now().strftime("%Y%m%dT%H%M%S").to_string();

    let mut backup_name = format!("{name}.corrupt-{stamp}");
    let mut attempt = 1;
    while path.with_file_name(&backup_name).exists() {
        backup_name = format!("{name}.corrupt-{stamp}-{attempt}");
        attempt += 1;
    }

    let backup = path.with_file_name(&backup_name);
    fs::rename(path, &backup)?;

    for suffix in ["-wal", "-shm"] {
        let sibling = path.with_file_name(format!("{name}{suffix}"));
        if sibling.exists() {
            fs::rename(&sibling, path.with_file_name(format!("{backup_name}{suffix}")))?;
        }
    }

    Ok(backup)
}

fn now_ms() -> i64 {
    Timestamp::now().as_millisecond()
}

fn timestamp_from_ms(ms: i64) -> Result<Timestamp> {
    Timestamp::from_millisecond(ms)
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp {ms}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::model::JobStatus;

    #[test]
    fn open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state").join("history.db");

        let storage = Storage::open(&path, DEFAULT_RETENTION).unwrap();

        assert!(path.exists());
        assert!(storage.recovered_from().is_none());
    }

    #[test]
    fn reopen_keeps_existing_jobs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.db");

        let storage = Storage::open(&path, DEFAULT_RETENTION).unwrap();
        storage
            .insert_job("job-1", "readmission_by_age", JobStatus::Running)
            .unwrap();
        storage.close().unwrap();

        let storage = Storage::open(&path, DEFAULT_RETENTION).unwrap();
        assert!(storage.recovered_from().is_none());
        assert!(storage.get_job("job-1").unwrap().is_some());
    }

    #[test]
    fn corrupted_file_is_quarantined_and_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.db");
        let noise = b"not a database. ".repeat(256);
        fs::write(&path, &noise).unwrap();

        let storage = Storage::open(&path, DEFAULT_RETENTION).unwrap();

        // The original bytes survive under a distinct name.
        let backup = storage.recovered_from().unwrap().to_path_buf();
        assert_ne!(backup, path);
        assert!(backup.exists());
        assert!(
            backup
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("history.db.corrupt-")
        );
        assert_eq!(fs::read(&backup).unwrap(), noise);

        // The fresh store is empty and usable.
        let page = storage.get_history(&crate::model::HistoryQuery::default()).unwrap();
        assert_eq!(page.total, 0);
        storage.insert_job("job-1", "n", JobStatus::Running).unwrap();
        assert!(storage.get_job("job-1").unwrap().is_some());
    }

    #[test]
    fn repeated_quarantine_never_overwrites_a_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.db");

        let one = b"garbage one ".repeat(256);
        fs::write(&path, &one).unwrap();
        let first = Storage::open(&path, DEFAULT_RETENTION).unwrap();
        let first_backup = first.recovered_from().unwrap().to_path_buf();
        first.close().unwrap();

        fs::remove_file(&path).unwrap();
        let _ = fs::remove_file(path.with_file_name("history.db-wal"));
        let _ = fs::remove_file(path.with_file_name("history.db-shm"));
        let two = b"garbage two ".repeat(256);
        fs::write(&path, &two).unwrap();
        let second = Storage::open(&path, DEFAULT_RETENTION).unwrap();
        let second_backup = second.recovered_from().unwrap().to_path_buf();

        assert_ne!(first_backup, second_backup);
        assert_eq!(fs::read(&first_backup).unwrap(), one);
        assert_eq!(fs::read(&second_backup).unwrap(), two);
    }

    #[tokio::test]
    async fn blocking_runs_against_the_same_store() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("history.db"), 10).unwrap());

        let job = storage
            .blocking(|s| s.insert_job("job-1", "n", JobStatus::Running))
            .await
            .unwrap();

        assert_eq!(job.id, "job-1");
        assert!(storage.get_job("job-1").unwrap().is_some());
    }

    #[test]
    fn retention_is_at_least_one() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("history.db"), 0).unwrap();
        assert_eq!(storage.retention(), 1);
    }
}
