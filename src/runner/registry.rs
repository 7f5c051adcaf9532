//! In-memory view of live and recently finished jobs.
//!
//! Holds the tail of each job's captured output so a client can poll
//! without touching the store. Empty after a restart; the store is the
//! durable record.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::model::JobStatus;

/// What `/api/job/{id}` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub output: Vec<String>,

    /// Milliseconds since the job started, frozen once it finishes.
    pub elapsed: u64,
}

#[derive(Debug)]
struct Entry {
    status: JobStatus,
    output: VecDeque<String>,
    started: Instant,
    finished: Option<Instant>,
}

impl Entry {
    fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started)
    }
}

/// Bounded registry of jobs.
///
/// Running jobs are never evicted. Once more than `capacity` jobs have
/// finished, the oldest finished ones are dropped. Each entry keeps at
/// most `max_lines` of the newest output lines.
#[derive(Debug)]
pub struct JobRegistry {
    entries: HashMap<String, Entry>,
    finished: VecDeque<String>,
    capacity: usize,
    max_lines: usize,
}

impl JobRegistry {
    pub fn new(capacity: usize, max_lines: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            capacity: capacity.max(1),
            max_lines: max_lines.max(1),
        }
    }

    pub fn register(&mut self, job_id: &str) {
        self.entries.insert(
            job_id.to_string(),
            Entry {
                status: JobStatus::Running,
                output: VecDeque::new(),
                started: Instant::now(),
                finished: None,
            },
        );
    }

    pub fn push_line(&mut self, job_id: &str, line: String) {
        if let Some(entry) = self.entries.get_mut(job_id) {
            if entry.output.len() == self.max_lines {
                entry.output.pop_front();
            }
            entry.output.push_back(line);
        }
    }

    /// Records the final status and evicts beyond capacity.
    pub fn finish(&mut self, job_id: &str, status: JobStatus) {
        let Some(entry) = self.entries.get_mut(job_id) else {
            return;
        };
        if entry.finished.is_some() {
            return;
        }
        entry.status = status;
        entry.finished = Some(Instant::now());
        self.finished.push_back(job_id.to_string());

        while self.finished.len() > self.capacity {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.entries.get(job_id).map(|entry| JobSnapshot {
            status: entry.status,
            output: entry.output.iter().cloned().collect(),
            elapsed: u64::try_from(entry.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Ids of jobs that have not finished yet.
    pub fn running(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.finished.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
