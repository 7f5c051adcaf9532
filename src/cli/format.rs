//! Output formatting for CLI display.

use crate::model::Job;

/// One history line: short id, status, node, duration.
pub(super) fn job_row(job: &Job) -> String {
    format!(
        "{}  {:<9}  {:<32}  {}",
        short_id(&job.id),
        job.status.as_str(),
        job.node_id,
        format_duration(job.duration_ms())
    )
}

/// The last 8 characters: v7 ids share their leading timestamp bits.
fn short_id(id: &str) -> &str {
    id.char_indices()
        .rev()
        .nth(7)
        .map_or(id, |(i, _)| &id[i..])
}

pub(super) fn format_duration(ms: Option<i64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1_000 => format!("{ms}ms"),
        Some(ms) if ms < 60_000 => format!("{}.{}s", ms / 1_000, ms % 1_000 / 100),
        Some(ms) => format!("{}m{:02}s", ms / 60_000, ms % 60_000 / 1_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use jiff::Timestamp;

    use crate::model::JobStatus;

    #[test]
    fn durations() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(420)), "420ms");
        assert_eq!(format_duration(Some(2_350)), "2.3s");
        assert_eq!(format_duration(Some(125_000)), "2m05s");
    }

    #[test]
    fn short_ids_keep_the_random_tail() {
        assert_eq!(short_id("0190a6e2-7c1d-7b3e-9f00-1234abcd5678"), "abcd5678");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn row_is_aligned() {
        let job = Job {
            id: "0190a6e2-7c1d-7b3e-9f00-1234abcd5678".into(),
            node_id: "cohort".into(),
            status: JobStatus::Failed,
            start_time: Timestamp::from_millisecond(0).unwrap(),
            end_time: Some(Timestamp::from_millisecond(1_500).unwrap()),
            exit_code: Some(1),
            error_message: None,
        };

        let row = job_row(&job);

        assert!(row.starts_with("abcd5678  failed     cohort"));
        assert!(row.ends_with("  1.5s"));
    }
}
