//! Job types: one execution attempt and the output it produced.

use std::{fmt, str::FromStr};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// One execution attempt of a requested subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    /// The primary output requested.
    pub node_id: String,

    pub status: JobStatus,
    pub start_time: Timestamp,

    /// Set together with `exit_code` when the job leaves `running`.
    pub end_time: Option<Timestamp>,

    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

impl Job {
    /// Wall-clock duration in milliseconds, once the job has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        let end = self.end_time?;
        Some(end.as_millisecond() - self.start_time.as_millisecond())
    }
}

/// Where a job stands. Moves `Running → Completed | Failed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("unknown stream: {other}")),
        }
    }
}

/// One captured line of a job's output.
///
/// `id` is assigned by the store and only ever grows, so it doubles
/// as the cursor for incremental reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub id: i64,
    pub job_id: String,
    pub timestamp: Timestamp,
    pub stream: Stream,
    pub line: String,
}

/// A partial update to a job row.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    /// The one terminal update a finished job receives.
    pub fn finished(status: JobStatus, exit_code: i64, error_message: Option<String>) -> Self {
        Self {
            status: Some(status),
            exit_code: Some(exit_code),
            error_message,
        }
    }
}

/// Filters and paging for a history listing.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub node_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            node_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of history, most recent first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub has_more: bool,
}

/// Aggregate run counts for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,

    /// Mean duration of completed runs, in milliseconds.
    #[serde(rename = "avgDuration")]
    pub avg_duration_ms: Option<f64>,
}
