//! History queries: paginated listings and per-node aggregates.

use std::collections::BTreeMap;

use rusqlite::params;

use crate::model::{HistoryPage, HistoryQuery, JobStatus, NodeStats};

use super::{
    Result, Storage,
    job::{JOB_COLUMNS, JobRow, read_job_row},
};

impl Storage {
    /// Lists jobs, most recent first, with the unpaged total.
    pub fn get_history(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let node = query.node_id.as_deref();
        let status = query.status.map(JobStatus::as_str);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);

        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE (?1 IS NULL OR node_id = ?1) AND (?2 IS NULL OR status = ?2)",
            params![node, status],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR node_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY start_time DESC, rowid DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt
            .query_map(params![node, status, limit, offset], read_job_row)?
            .collect::<rusqlite::Result<Vec<JobRow>>>()?;
        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;

        let total = u64::try_from(total).unwrap_or_default();
        let seen = (query.offset + jobs.len()) as u64;
        Ok(HistoryPage {
            has_more: seen < total,
            jobs,
            total,
        })
    }

    /// Run counts and mean completed duration for one node.
    pub fn get_node_stats(&self, node_id: &str) -> Result<NodeStats> {
        let conn = self.conn();
        let (total, completed, failed, avg) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    AVG(CASE WHEN status = 'completed' AND end_time IS NOT NULL
                             THEN end_time - start_time END)
             FROM jobs WHERE node_id = ?1",
            [node_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;

        Ok(NodeStats {
            total: u64::try_from(total).unwrap_or_default(),
            completed: u64::try_from(completed).unwrap_or_default(),
            failed: u64::try_from(failed).unwrap_or_default(),
            avg_duration_ms: avg,
        })
    }

    /// Total runs per node, for UI badges.
    pub fn get_history_count_by_node(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT node_id, COUNT(*) FROM jobs GROUP BY node_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (node, count) = row?;
            counts.insert(node, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::model::JobUpdate;

    fn test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("history.db"), 100).unwrap();
        (dir, storage)
    }

    fn finish(storage: &Storage, id: &str, status: JobStatus) {
        let code = if status == JobStatus::Completed { 0 } else { 1 };
        storage
            .update_job(id, &JobUpdate::finished(status, code, None))
            .unwrap();
    }

    /// Inserts jobs across two nodes with mixed outcomes.
    fn seed(storage: &Storage) {
        let runs = [
            ("j1", "alpha", JobStatus::Completed),
            ("j2", "alpha", JobStatus::Failed),
            ("j3", "beta", JobStatus::Completed),
            ("j4", "alpha", JobStatus::Completed),
            ("j5", "beta", JobStatus::Running),
        ];
        for (id, node, status) in runs {
            storage.insert_job(id, node, JobStatus::Running).unwrap();
            if status.is_terminal() {
                finish(storage, id, status);
            }
        }
    }

    #[test]
    fn history_is_most_recent_first() {
        let (_dir, storage) = test_storage();
        seed(&storage);

        let page = storage.get_history(&HistoryQuery::default()).unwrap();

        let ids: Vec<&str> = page.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["j5", "j4", "j3", "j2", "j1"]);
        assert_eq!(page.total, 5);
        assert!(!page.has_more);
    }

    #[test]
    fn history_filters_by_node_and_status() {
        let (_dir, storage) = test_storage();
        seed(&storage);

        let alpha = storage
            .get_history(&HistoryQuery {
                node_id: Some("alpha".into()),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(alpha.total, 3);
        assert!(alpha.jobs.iter().all(|j| j.node_id == "alpha"));

        let alpha_completed = storage
            .get_history(&HistoryQuery {
                node_id: Some("alpha".into()),
                status: Some(JobStatus::Completed),
                ..HistoryQuery::default()
            })
            .unwrap();
        let ids: Vec<&str> = alpha_completed.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["j4", "j1"]);

        let running = storage
            .get_history(&HistoryQuery {
                status: Some(JobStatus::Running),
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(running.total, 1);
        assert_eq!(running.jobs[0].id, "j5");
    }

    #[test]
    fn history_paginates() {
        let (_dir, storage) = test_storage();
        seed(&storage);

        let first = storage
            .get_history(&HistoryQuery {
                limit: 2,
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(first.jobs.len(), 2);
        assert_eq!(first.total, 5);
        assert!(first.has_more);

        let last = storage
            .get_history(&HistoryQuery {
                limit: 2,
                offset: 4,
                ..HistoryQuery::default()
            })
            .unwrap();
        assert_eq!(last.jobs.len(), 1);
        assert_eq!(last.jobs[0].id, "j1");
        assert!(!last.has_more);
    }

    #[test]
    fn node_stats_count_outcomes() {
        let (_dir, storage) = test_storage();
        seed(&storage);

        let alpha = storage.get_node_stats("alpha").unwrap();
        assert_eq!(alpha.total, 3);
        assert_eq!(alpha.completed, 2);
        assert_eq!(alpha.failed, 1);
        assert!(alpha.avg_duration_ms.unwrap() >= 0.0);

        let beta = storage.get_node_stats("beta").unwrap();
        assert_eq!(beta.total, 2);
        assert_eq!(beta.completed, 1);
        assert_eq!(beta.failed, 0);
    }

    #[test]
    fn node_stats_for_unknown_node_are_empty() {
        let (_dir, storage) = test_storage();

        let stats = storage.get_node_stats("nobody").unwrap();

        assert_eq!(
            stats,
            NodeStats {
                total: 0,
                completed: 0,
                failed: 0,
                avg_duration_ms: None,
            }
        );
    }

    #[test]
    fn average_ignores_failed_runs() {
        let (_dir, storage) = test_storage();
        storage.insert_job("f", "gamma", JobStatus::Running).unwrap();
        finish(&storage, "f", JobStatus::Failed);

        let stats = storage.get_node_stats("gamma").unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.avg_duration_ms, None);
    }

    #[test]
    fn counts_by_node() {
        let (_dir, storage) = test_storage();
        seed(&storage);

        let counts = storage.get_history_count_by_node().unwrap();

        assert_eq!(counts.len(), 2);
        assert_eq!(counts["alpha"], 3);
        assert_eq!(counts["beta"], 2);
    }
}
