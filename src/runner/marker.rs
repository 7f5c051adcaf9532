//! The engine's final status line, and how a job's outcome is judged.

use serde::Deserialize;

use crate::model::JobStatus;

/// `{"status": "success" | "error", "error"?, "message"?}`
#[derive(Debug, Deserialize)]
struct Marker {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// The outcome recorded for a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: JobStatus,
    pub message: Option<String>,
}

/// Decide a job's outcome from its last stdout line and exit code.
///
/// A marker wins over the exit code. Without one, exit code 0 means the
/// job completed.
pub fn judge(last_line: Option<&str>, exit_code: i64) -> Verdict {
    let marker = last_line.and_then(|line| serde_json::from_str::<Marker>(line.trim()).ok());

    match marker {
        Some(m) if m.status == "success" => Verdict {
            status: JobStatus::Completed,
            message: None,
        },
        Some(m) if m.status == "error" => Verdict {
            status: JobStatus::Failed,
            message: m.error.or(m.message),
        },
        _ if exit_code == 0 => Verdict {
            status: JobStatus::Completed,
            message: None,
        },
        _ => Verdict {
            status: JobStatus::Failed,
            message: None,
        },
    }
}
