//! Job storage: create, update, load, and prune jobs.

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::debug;

use crate::model::{Job, JobStatus, JobUpdate};

use super::{Result, Storage, StorageError, now_ms, timestamp_from_ms};

pub(super) const JOB_COLUMNS: &str =
    "id, node_id, status, start_time, end_time, exit_code, error_message";

impl Storage {
    /// Creates a job row stamped with the current time, then prunes
    /// history down to the retention ceiling.
    pub fn insert_job(&self, id: &str, node_id: &str, status: JobStatus) -> Result<Job> {
        let start = now_ms();
        let end = status.is_terminal().then_some(start);
        {
            let conn = self.conn();
            let inserted = conn.execute(
                "INSERT INTO jobs (id, node_id, status, start_time, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, node_id, status.as_str(), start, end],
            );
            match inserted {
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StorageError::JobAlreadyExists(id.to_string()));
                }
                other => {
                    other?;
                }
            }
        }

        self.prune_old_jobs(self.retention)?;

        Ok(Job {
            id: id.to_string(),
            node_id: node_id.to_string(),
            status,
            start_time: timestamp_from_ms(start)?,
            end_time: end.map(timestamp_from_ms).transpose()?,
            exit_code: None,
            error_message: None,
        })
    }

    /// Applies a partial update and returns the updated job.
    ///
    /// Moving to a terminal status stamps `end_time` in the same statement.
    /// A terminal job rejects every further update, and an exit code is only
    /// accepted together with a terminal status.
    pub fn update_job(&self, id: &str, update: &JobUpdate) -> Result<Job> {
        let finishing = update.status.is_some_and(JobStatus::is_terminal);
        if update.exit_code.is_some() && !finishing {
            return Err(StorageError::ExitWithoutFinish(id.to_string()));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(current) = current else {
            return Err(StorageError::JobNotFound(id.to_string()));
        };
        let current = parse_status(&current)?;

        if current.is_terminal() {
            return Err(StorageError::JobFinished(id.to_string()));
        }

        tx.execute(
            "UPDATE jobs
             SET status = COALESCE(?1, status),
                 exit_code = COALESCE(?2, exit_code),
                 error_message = COALESCE(?3, error_message),
                 end_time = CASE WHEN ?4 THEN ?5 ELSE end_time END
             WHERE id = ?6",
            params![
                update.status.map(JobStatus::as_str),
                update.exit_code,
                update.error_message,
                finishing,
                now_ms(),
                id,
            ],
        )?;

        let job = load_job(&tx, id)?.ok_or_else(|| StorageError::JobNotFound(id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    /// Loads a single job.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        load_job(&conn, id)
    }

    /// Deletes every job beyond the `keep` most recent, with their log lines.
    ///
    /// Returns the number of jobs removed.
    pub fn prune_old_jobs(&self, keep: usize) -> Result<usize> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let doomed = "SELECT id FROM jobs ORDER BY start_time DESC, rowid DESC LIMIT -1 OFFSET ?1";

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM job_logs WHERE job_id IN ({doomed})"),
            [keep],
        )?;
        let removed = tx.execute(&format!("DELETE FROM jobs WHERE id IN ({doomed})"), [keep])?;
        tx.commit()?;

        if removed > 0 {
            debug!(removed, keep, "pruned old jobs");
        }
        Ok(removed)
    }

    /// Fails every job still marked running.
    ///
    /// Called once at startup: a fresh process owns no children, so any
    /// `running` row was left behind by a previous one.
    pub fn fail_orphaned_jobs(&self, message: &str) -> Result<usize> {
        let conn = self.conn();
        let failed = conn.execute(
            "UPDATE jobs
             SET status = 'failed', exit_code = -1, error_message = ?1, end_time = ?2
             WHERE status = 'running'",
            params![message, now_ms()],
        )?;
        Ok(failed)
    }
}

/// Reads one job by id from an open connection.
fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            read_job_row,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

/// Raw column values of a job row, before validation.
pub(super) struct JobRow {
    id: String,
    node_id: String,
    status: String,
    start_time: i64,
    end_time: Option<i64>,
    exit_code: Option<i64>,
    error_message: Option<String>,
}

/// Row mapper for queries selecting [`JOB_COLUMNS`].
pub(super) fn read_job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        node_id: row.get(1)?,
        status: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        exit_code: row.get(5)?,
        error_message: row.get(6)?,
    })
}

impl JobRow {
    pub(super) fn into_job(self) -> Result<Job> {
        Ok(Job {
            status: parse_status(&self.status)?,
            start_time: timestamp_from_ms(self.start_time)?,
            end_time: self.end_time.map(timestamp_from_ms).transpose()?,
            id: self.id,
            node_id: self.node_id,
            exit_code: self.exit_code,
            error_message: self.error_message,
        })
    }
}

fn parse_status(s: &str) -> Result<JobStatus> {
    s.parse().map_err(StorageError::Corrupt)
}
