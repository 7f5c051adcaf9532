//! Log storage: append captured output lines and read them back by cursor.

use rusqlite::params;

use crate::model::{LogLine, Stream};

use super::{Result, Storage, StorageError, now_ms, timestamp_from_ms};

impl Storage {
    /// Appends one line of output to a job. Returns the line's id.
    ///
    /// Ids only ever grow, across all jobs.
    pub fn insert_log(&self, job_id: &str, stream: Stream, line: &str) -> Result<i64> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO job_logs (job_id, timestamp, stream, line)
             SELECT ?1, ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1)",
            params![job_id, now_ms(), stream.as_str(), line],
        )?;
        if inserted == 0 {
            return Err(StorageError::JobNotFound(job_id.to_string()));
        }
        Ok(conn.last_insert_rowid())
    }

    /// Loads a job's lines in insertion order.
    ///
    /// With `after`, only lines whose id is greater than the cursor.
    /// An unknown job simply has no lines.
    pub fn get_job_logs(&self, job_id: &str, after: Option<i64>) -> Result<Vec<LogLine>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, job_id, timestamp, stream, line FROM job_logs
             WHERE job_id = ?1 AND id > ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id, after.unwrap_or(0)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut lines = Vec::new();
        for row in rows {
            let (id, job_id, timestamp, stream, line) = row?;
            lines.push(LogLine {
                id,
                job_id,
                timestamp: timestamp_from_ms(timestamp)?,
                stream: stream.parse().map_err(StorageError::Corrupt)?,
                line,
            });
        }
        Ok(lines)
    }
}
