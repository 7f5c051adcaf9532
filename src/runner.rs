//! Job execution: run the pipeline engine as a child process and record
//! everything it prints.
//!
//! Each job gets a supervisor task and two reader tasks, one per output
//! pipe. Readers write every line to the store and the registry as it
//! arrives. The supervisor waits for both readers and the process exit
//! before recording the outcome, so a job is never terminal while lines
//! it printed are still unwritten.

mod marker;
mod registry;

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::RunnerConfig,
    model::{Job, JobStatus, JobUpdate, Stream},
    storage::{Storage, StorageError},
};

use registry::JobRegistry;
pub use registry::JobSnapshot;

/// Message recorded for jobs cut short by shutdown.
pub const SHUTDOWN_MESSAGE: &str = "terminated by server shutdown";

/// Errors returned when starting a job.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no outputs requested")]
    NoOutputs,

    #[error("engine command is empty")]
    EmptyCommand,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = core::result::Result<T, RunError>;

/// Starts and tracks engine processes.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Arc<Storage>,
    root: PathBuf,
    command: Vec<String>,
    cache_dir: PathBuf,
    registry: Mutex<JobRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// What one reader task saw.
#[derive(Debug, Default)]
struct Capture {
    last_line: Option<String>,
    store_error: Option<String>,
}

impl JobRunner {
    /// `root` is the engine's working directory; `cache_dir` is handed to it
    /// through the environment.
    pub fn new(
        storage: Arc<Storage>,
        root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        config: &RunnerConfig,
    ) -> Result<Self> {
        if config.command.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                root: root.into(),
                command: config.command.clone(),
                cache_dir: cache_dir.into(),
                registry: Mutex::new(JobRegistry::new(config.registry_capacity, config.registry_lines)),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Start a job for `outputs` and return its row as inserted.
    ///
    /// `node_id` is the job's primary node, `outputs[0]` when absent. A
    /// process that cannot be spawned still yields a job; it is recorded
    /// as failed right away.
    pub fn run(&self, outputs: &[String], node_id: Option<&str>) -> Result<Job> {
        let Some(first) = outputs.first() else {
            return Err(RunError::NoOutputs);
        };
        if self.inner.shutdown.is_cancelled() {
            return Err(RunError::ShuttingDown);
        }
        let node_id = node_id.filter(|n| !n.is_empty()).unwrap_or(first.as_str());
        let (program, args) = self
            .inner
            .command
            .split_first()
            .ok_or(RunError::EmptyCommand)?;

        let job_id = Uuid::now_v7().to_string();
        let job = self
            .inner
            .storage
            .insert_job(&job_id, node_id, JobStatus::Running)?;
        self.inner.registry().register(&job_id);
        info!(job = %job_id, node = %node_id, ?outputs, "starting job");

        let mut command = Command::new(program);
        command
            .args(args)
            .args(outputs)
            .current_dir(&self.inner.root)
            .env("DAGBOARD_JOB_ID", &job_id)
            .env("DAGBOARD_CACHE_DIR", &self.inner.cache_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match command.spawn() {
            Ok(child) => {
                let inner = Arc::clone(&self.inner);
                let id = job_id.clone();
                self.inner.tasks.spawn(supervise(inner, id, child));
            }
            Err(e) => {
                warn!(job = %job_id, error = %e, "failed to spawn engine");
                self.inner
                    .finish(&job_id, JobStatus::Failed, -1, Some(e.to_string()));
            }
        }

        Ok(job)
    }

    /// The in-memory view of a job, if it's still in the registry.
    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.registry().snapshot(job_id)
    }

    /// Kill every running engine. Their jobs are recorded as failed.
    pub fn shutdown(&self) {
        let running = self.inner.registry().running();
        if !running.is_empty() {
            info!(jobs = running.len(), "terminating running jobs");
        }
        self.inner.shutdown.cancel();
    }

    /// Wait for supervisors to record their outcomes. Returns `false` if
    /// some were still busy when `timeout` elapsed.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.tasks.close();
        let idle = tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_ok();
        if !idle {
            warn!(
                pending = self.inner.tasks.len(),
                "jobs still finishing after timeout"
            );
        }
        idle
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, JobRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a job's outcome in the registry and the store.
    fn finish(&self, job_id: &str, status: JobStatus, exit_code: i64, message: Option<String>) {
        self.registry().finish(job_id, status);

        let update = JobUpdate::finished(status, exit_code, message);
        match self.storage.update_job(job_id, &update) {
            Ok(_) => info!(job = %job_id, %status, exit_code, "job finished"),
            Err(e) => error!(job = %job_id, error = %e, "failed to record job outcome"),
        }
    }
}

async fn supervise(inner: Arc<Inner>, job_id: String, mut child: Child) {
    let stdout = tokio::spawn(capture(
        Arc::clone(&inner),
        job_id.clone(),
        Stream::Stdout,
        child.stdout.take(),
    ));
    let stderr = tokio::spawn(capture(
        Arc::clone(&inner),
        job_id.clone(),
        Stream::Stderr,
        child.stderr.take(),
    ));

    let (exit, cancelled) = tokio::select! {
        status = child.wait() => (status, false),
        () = inner.shutdown.cancelled() => {
            debug!(job = %job_id, "killing engine for shutdown");
            if let Err(e) = child.kill().await {
                warn!(job = %job_id, error = %e, "failed to kill engine");
            }
            (child.wait().await, true)
        }
    };

    // Readers end once the pipes close, which happens at exit.
    let stdout = stdout.await.unwrap_or_else(|e| Capture {
        last_line: None,
        store_error: Some(format!("stdout reader panicked: {e}")),
    });
    let stderr = stderr.await.unwrap_or_else(|e| Capture {
        last_line: None,
        store_error: Some(format!("stderr reader panicked: {e}")),
    });

    let exit_code = match exit {
        Ok(status) => status.code().map_or(-1, i64::from),
        Err(e) => {
            warn!(job = %job_id, error = %e, "failed to wait for engine");
            -1
        }
    };

    let (status, message) = if cancelled {
        (JobStatus::Failed, Some(SHUTDOWN_MESSAGE.to_string()))
    } else {
        let verdict = marker::judge(stdout.last_line.as_deref(), exit_code);
        match stdout.store_error.or(stderr.store_error) {
            Some(e) if verdict.status == JobStatus::Completed => (
                JobStatus::Failed,
                Some(format!("failed to persist output: {e}")),
            ),
            _ => (verdict.status, verdict.message),
        }
    };

    let recorder = Arc::clone(&inner);
    let recorded = tokio::task::spawn_blocking(move || {
        recorder.finish(&job_id, status, exit_code, message);
    })
    .await;
    if let Err(e) = recorded {
        error!(error = %e, "job outcome recorder panicked");
    }
}

/// Drain one pipe to the end, line by line.
///
/// A store failure is remembered but never stops the draining, so the
/// child can't block on a full pipe.
async fn capture<R>(inner: Arc<Inner>, job_id: String, stream: Stream, pipe: Option<R>) -> Capture
where
    R: AsyncRead + Unpin,
{
    let mut result = Capture::default();
    let Some(pipe) = pipe else {
        return result;
    };

    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(job = %job_id, stream = stream.as_str(), error = %e, "failed to read engine output");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();

        let stored = {
            let (id, line) = (job_id.clone(), line.clone());
            inner
                .storage
                .blocking(move |s| s.insert_log(&id, stream, &line))
                .await
        };
        if let Err(e) = stored {
            if result.store_error.is_none() {
                error!(job = %job_id, stream = stream.as_str(), error = %e, "failed to store output line");
            }
            result.store_error.get_or_insert_with(|| e.to_string());
        }
        if !line.trim().is_empty() {
            result.last_line = Some(line.clone());
        }
        inner.registry().push_line(&job_id, line);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    fn runner_with(script: &str) -> (TempDir, Arc<Storage>, JobRunner) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("history.db"), 100).unwrap());
        let config = RunnerConfig {
            // Outputs land in "$1", "$2", ...
            command: vec!["sh".into(), "-c".into(), script.into(), "engine".into()],
            registry_capacity: 10,
            ..RunnerConfig::default()
        };
        let runner = JobRunner::new(
            Arc::clone(&storage),
            dir.path(),
            dir.path().join("results/cache"),
            &config,
        )
        .unwrap();
        (dir, storage, runner)
    }

    async fn run_to_end(runner: &JobRunner, storage: &Storage, outputs: &[&str]) -> Job {
        let outputs: Vec<String> = outputs.iter().map(ToString::to_string).collect();
        let id = runner.run(&outputs, None).unwrap().id;
        assert!(runner.wait_idle(WAIT).await);
        storage.get_job(&id).unwrap().unwrap()
    }

    fn lines(storage: &Storage, job_id: &str, stream: Stream) -> Vec<String> {
        storage
            .get_job_logs(job_id, None)
            .unwrap()
            .into_iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.line)
            .collect()
    }

    #[tokio::test]
    async fn successful_run_records_output_and_completes() {
        let (_dir, storage, runner) = runner_with(
            r#"echo "running $1"; echo "careful" >&2; echo '{"status": "success"}'"#,
        );

        let job = run_to_end(&runner, &storage, &["readmission_by_age"]).await;

        assert_eq!(job.node_id, "readmission_by_age");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.end_time.is_some());
        assert_eq!(job.error_message, None);

        assert_eq!(lines(&storage, &job.id, Stream::Stdout), [
            "running readmission_by_age",
            r#"{"status": "success"}"#,
        ]);
        assert_eq!(lines(&storage, &job.id, Stream::Stderr), ["careful"]);

        let snapshot = runner.snapshot(&job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.output.len(), 3);
    }

    #[tokio::test]
    async fn error_marker_fails_with_its_message() {
        let (_dir, storage, runner) =
            runner_with(r#"echo '{"status": "error", "error": "KeyError: age"}'; exit 1"#);

        let job = run_to_end(&runner, &storage, &["cohort"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(1));
        assert_eq!(job.error_message.as_deref(), Some("KeyError: age"));
    }

    #[tokio::test]
    async fn nonzero_exit_with_garbled_marker_fails() {
        let (_dir, storage, runner) = runner_with(r#"echo '{"status": "succ'; exit 3"#);

        let job = run_to_end(&runner, &storage, &["cohort"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(3));
        assert_eq!(job.error_message, None);
    }

    #[tokio::test]
    async fn clean_exit_without_marker_completes() {
        let (_dir, storage, runner) = runner_with("echo done");

        let job = run_to_end(&runner, &storage, &["cohort"]).await;

        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn spawn_failure_still_returns_a_failed_job() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("history.db"), 100).unwrap());
        let config = RunnerConfig {
            command: vec!["dagboard-no-such-engine".into()],
            registry_capacity: 10,
            ..RunnerConfig::default()
        };
        let runner = JobRunner::new(Arc::clone(&storage), dir.path(), dir.path(), &config).unwrap();

        let id = runner.run(&["x".to_string()], Some("x")).unwrap().id;

        let job = storage.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(-1));
        assert!(job.error_message.is_some_and(|m| !m.is_empty()));
        assert_eq!(runner.snapshot(&id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn empty_outputs_are_rejected() {
        let (_dir, storage, runner) = runner_with("true");

        let err = runner.run(&[], None).unwrap_err();

        assert!(matches!(err, RunError::NoOutputs));
        let page = storage.get_history(&crate::model::HistoryQuery::default()).unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn primary_node_defaults_to_first_output() {
        let (_dir, storage, runner) = runner_with("true");

        let outputs = vec!["first".to_string(), "second".to_string()];
        let explicit = runner.run(&outputs, Some("chosen")).unwrap().id;
        let implicit = runner.run(&outputs, None).unwrap().id;
        assert!(runner.wait_idle(WAIT).await);

        assert_eq!(storage.get_job(&explicit).unwrap().unwrap().node_id, "chosen");
        assert_eq!(storage.get_job(&implicit).unwrap().unwrap().node_id, "first");
    }

    #[tokio::test]
    async fn engine_sees_job_environment() {
        let (_dir, storage, runner) = runner_with(
            r#"echo "$DAGBOARD_JOB_ID"; echo "$PYTHONUNBUFFERED"; echo "$2""#,
        );

        let job = run_to_end(&runner, &storage, &["a", "b"]).await;

        assert_eq!(lines(&storage, &job.id, Stream::Stdout), [
            job.id.as_str(),
            "1",
            "b"
        ]);
    }

    #[tokio::test]
    async fn per_stream_order_is_preserved() {
        let (_dir, storage, runner) = runner_with(
            r"i=0; while [ $i -lt 200 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done",
        );

        let job = run_to_end(&runner, &storage, &["n"]).await;

        let expected_out: Vec<String> = (0..200).map(|i| format!("out{i}")).collect();
        let expected_err: Vec<String> = (0..200).map(|i| format!("err{i}")).collect();
        assert_eq!(lines(&storage, &job.id, Stream::Stdout), expected_out);
        assert_eq!(lines(&storage, &job.id, Stream::Stderr), expected_err);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_jobs_keep_their_output_apart() {
        let (_dir, storage, runner) = runner_with(
            r#"i=0; while [ $i -lt 50 ]; do echo "$1 $i"; echo "$1 warn $i" >&2; i=$((i+1)); done"#,
        );

        let alpha = runner.run(&["alpha".to_string()], None).unwrap().id;
        let beta = runner.run(&["beta".to_string()], None).unwrap().id;
        assert!(runner.wait_idle(WAIT).await);

        for (id, name) in [(&alpha, "alpha"), (&beta, "beta")] {
            let job = storage.get_job(id).unwrap().unwrap();
            assert_eq!(job.node_id, name);
            assert_eq!(job.status, JobStatus::Completed);

            let out: Vec<String> = (0..50).map(|i| format!("{name} {i}")).collect();
            let err: Vec<String> = (0..50).map(|i| format!("{name} warn {i}")).collect();
            assert_eq!(lines(&storage, id, Stream::Stdout), out);
            assert_eq!(lines(&storage, id, Stream::Stderr), err);
        }
    }

    #[tokio::test]
    async fn shutdown_kills_running_jobs() {
        let (_dir, storage, runner) = runner_with("echo started; exec sleep 30");

        let id = runner.run(&["slow".to_string()], None).unwrap().id;
        // Let the engine print before pulling the plug.
        for _ in 0..100 {
            if !storage.get_job_logs(&id, None).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        runner.shutdown();
        assert!(runner.wait_idle(WAIT).await);

        let job = storage.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(SHUTDOWN_MESSAGE));
        assert_eq!(lines(&storage, &id, Stream::Stdout), ["started"]);

        let err = runner.run(&["again".to_string()], None).unwrap_err();
        assert!(matches!(err, RunError::ShuttingDown));
    }
}
