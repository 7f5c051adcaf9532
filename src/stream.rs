//! Live job events: replay what's stored, then follow new output.
//!
//! Each subscriber polls the store on its own. The cursor is the id of the
//! last line sent, so no line is sent twice and none is skipped. Dropping
//! the stream stops the polling; the job itself is never touched.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::Stream;
use jiff::Timestamp;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{
    config::StreamConfig,
    model::{self, Job, JobStatus, LogLine},
    storage::Storage,
};

/// Poll cadence and heartbeat for one subscriber.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub poll_interval: Duration,

    /// Quiet time after which a `ping` is sent.
    pub heartbeat: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            heartbeat: Duration::from_secs(config.heartbeat_secs),
        }
    }
}

/// One event on a job's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Status(StatusEvent),
    Log(LogEvent),
    Ping,
    Complete(CompleteEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub job_id: String,
    pub node_id: String,
    pub status: JobStatus,
    pub start_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub id: i64,
    pub stream: model::Stream,
    pub line: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEvent {
    pub status: JobStatus,
    pub exit_code: Option<i64>,
    pub end_time: Option<Timestamp>,

    /// Milliseconds.
    pub duration: Option<i64>,
    pub error_message: Option<String>,
}

impl JobEvent {
    /// The SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Log(_) => "log",
            Self::Ping => "ping",
            Self::Complete(_) => "complete",
        }
    }

    /// The SSE data payload.
    pub fn data(&self) -> serde_json::Result<String> {
        match self {
            Self::Status(e) => serde_json::to_string(e),
            Self::Log(e) => serde_json::to_string(e),
            Self::Ping => Ok("{}".to_string()),
            Self::Complete(e) => serde_json::to_string(e),
        }
    }
}

impl From<&Job> for StatusEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            node_id: job.node_id.clone(),
            status: job.status,
            start_time: job.start_time,
        }
    }
}

impl From<LogLine> for LogEvent {
    fn from(line: LogLine) -> Self {
        Self {
            id: line.id,
            stream: line.stream,
            line: line.line,
            timestamp: line.timestamp,
        }
    }
}

impl From<&Job> for CompleteEvent {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            exit_code: job.exit_code,
            end_time: job.end_time,
            duration: job.duration_ms(),
            error_message: job.error_message.clone(),
        }
    }
}

/// Follow a job until it finishes.
///
/// Yields `status` first, then every stored line oldest first, then new
/// lines as they land. Ends after `complete`, or early if the job vanishes
/// or the store can't be read.
pub fn watch(
    storage: Arc<Storage>,
    job: Job,
    settings: StreamSettings,
) -> impl Stream<Item = JobEvent> + Send + 'static {
    async_stream::stream! {
        yield JobEvent::Status(StatusEvent::from(&job));

        let mut cursor: Option<i64> = None;
        let mut quiet_since = Instant::now();
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let id = job.id.clone();
            let after = cursor;
            // Read the row before the lines: if it's terminal here, every
            // line the job printed is already stored.
            let polled = storage
                .blocking(move |s| {
                    let Some(current) = s.get_job(&id)? else {
                        return Ok(None);
                    };
                    Ok(Some((current, s.get_job_logs(&id, after)?)))
                })
                .await;
            let (current, lines) = match polled {
                Ok(Some(polled)) => polled,
                Ok(None) => {
                    warn!(job = %job.id, "job disappeared while streaming");
                    break;
                }
                Err(e) => {
                    warn!(job = %job.id, error = %e, "failed to read job while streaming");
                    break;
                }
            };

            for line in lines {
                cursor = Some(line.id);
                quiet_since = Instant::now();
                yield JobEvent::Log(LogEvent::from(line));
            }

            if current.status.is_terminal() {
                debug!(job = %job.id, status = %current.status, "stream complete");
                yield JobEvent::Complete(CompleteEvent::from(&current));
                break;
            }

            if quiet_since.elapsed() >= settings.heartbeat {
                quiet_since = Instant::now();
                yield JobEvent::Ping;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;
    use tempfile::TempDir;

    use crate::model::{JobUpdate, Stream as Pipe};

    const FAST: StreamSettings = StreamSettings {
        poll_interval: Duration::from_millis(5),
        heartbeat: Duration::from_secs(60),
    };

    fn test_storage() -> (TempDir, Arc<Storage>) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("history.db"), 100).unwrap();
        (dir, Arc::new(storage))
    }

    fn start(storage: &Storage, id: &str) -> Job {
        storage.insert_job(id, "node", JobStatus::Running).unwrap()
    }

    async fn collect(storage: &Arc<Storage>, job: Job, settings: StreamSettings) -> Vec<JobEvent> {
        let events = watch(Arc::clone(storage), job, settings).collect::<Vec<_>>();
        tokio::time::timeout(Duration::from_secs(10), events)
            .await
            .unwrap()
    }

    fn log_lines(events: &[JobEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Log(l) => Some(l.line.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn finished_job_replays_everything_then_completes() {
        let (_dir, storage) = test_storage();
        let job = start(&storage, "j");
        for i in 0..5 {
            storage.insert_log("j", Pipe::Stdout, &format!("line {i}")).unwrap();
        }
        storage
            .update_job("j", &JobUpdate::finished(JobStatus::Completed, 0, None))
            .unwrap();

        let events = collect(&storage, job, FAST).await;

        assert_eq!(events.first().map(JobEvent::name), Some("status"));
        assert_eq!(log_lines(&events), (0..5).map(|i| format!("line {i}")).collect::<Vec<_>>());
        let Some(JobEvent::Complete(complete)) = events.last() else {
            panic!("expected complete, got {events:?}");
        };
        assert_eq!(complete.status, JobStatus::Completed);
        assert_eq!(complete.exit_code, Some(0));
        assert!(complete.duration.is_some());
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn live_lines_arrive_once_and_in_order() {
        let (_dir, storage) = test_storage();
        let job = start(&storage, "j");
        storage.insert_log("j", Pipe::Stdout, "before").unwrap();

        let writer = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                for i in 0..20 {
                    storage.insert_log("j", Pipe::Stderr, &format!("live {i}")).unwrap();
                    if i % 5 == 0 {
                        tokio::time::sleep(Duration::from_millis(15)).await;
                    }
                }
                storage
                    .update_job(
                        "j",
                        &JobUpdate::finished(JobStatus::Failed, 2, Some("boom".into())),
                    )
                    .unwrap();
            })
        };

        let events = collect(&storage, job, FAST).await;
        writer.await.unwrap();

        let mut expected = vec!["before".to_string()];
        expected.extend((0..20).map(|i| format!("live {i}")));
        assert_eq!(log_lines(&events), expected);

        let ids: Vec<i64> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Log(l) => Some(l.id),
                _ => None,
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let Some(JobEvent::Complete(complete)) = events.last() else {
            panic!("expected complete");
        };
        assert_eq!(complete.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn quiet_job_gets_pings() {
        let (_dir, storage) = test_storage();
        let job = start(&storage, "j");
        let settings = StreamSettings {
            poll_interval: Duration::from_millis(5),
            heartbeat: Duration::from_millis(20),
        };

        let mut events = Box::pin(watch(Arc::clone(&storage), job, settings));

        assert_eq!(events.next().await.map(|e| e.name()), Some("status"));
        let next = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        assert_eq!(next, Some(JobEvent::Ping));
    }

    #[tokio::test]
    async fn pruned_job_ends_the_stream() {
        let (_dir, storage) = test_storage();
        let job = start(&storage, "j");
        storage.prune_old_jobs(0).unwrap();

        let events = collect(&storage, job, FAST).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "status");
    }

    #[test]
    fn event_payloads_use_client_keys() {
        let job = Job {
            id: "j".into(),
            node_id: "n".into(),
            status: JobStatus::Failed,
            start_time: Timestamp::from_millisecond(1_000).unwrap(),
            end_time: Some(Timestamp::from_millisecond(3_500).unwrap()),
            exit_code: Some(1),
            error_message: None,
        };

        let status: serde_json::Value =
            serde_json::from_str(&JobEvent::Status(StatusEvent::from(&job)).data().unwrap())
                .unwrap();
        assert_eq!(status["jobId"], "j");
        assert_eq!(status["nodeId"], "n");

        let complete: serde_json::Value =
            serde_json::from_str(&JobEvent::Complete(CompleteEvent::from(&job)).data().unwrap())
                .unwrap();
        assert_eq!(complete["status"], "failed");
        assert_eq!(complete["exitCode"], 1);
        assert_eq!(complete["duration"], 2_500);
        assert!(complete["errorMessage"].is_null());
    }
}
