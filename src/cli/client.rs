//! Talking to a running server for `dagboard run`.
//!
//! A job is started with `POST /api/run` and followed over its event
//! stream. If the stream ends before `complete`, the job's final state is
//! polled from `/api/history/{id}` instead.

use std::{
    collections::BTreeMap,
    io::{self, Write},
    time::{Duration, Instant},
};

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use super::format::format_duration;
use crate::model::{Job, JobStatus, Stream};

/// How long a job is polled before giving up.
const POLL_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const RULE: &str = "----------------------------------------";

/// Errors returned while talking to the server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("gave up waiting for job {0}")]
    Timeout(String),
}

pub type Result<T> = core::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Started {
    pub job_id: String,
    pub node_id: String,
}

/// How a followed job ended.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub status: JobStatus,
    pub exit_code: Option<i64>,

    /// Milliseconds.
    pub duration: Option<i64>,
    pub error_message: Option<String>,
}

impl Outcome {
    /// What `dagboard run` exits with: the engine's code when it failed
    /// with one, else 0 for a completed job and 1 otherwise.
    pub fn process_code(&self) -> i32 {
        match self.exit_code {
            Some(code) if code != 0 => i32::try_from(code).unwrap_or(1),
            _ if self.status == JobStatus::Completed => 0,
            _ => 1,
        }
    }
}

impl From<&Job> for Outcome {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            exit_code: job.exit_code,
            duration: job.duration_ms(),
            error_message: job.error_message.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogPayload {
    stream: Stream,
    line: String,
}

#[derive(Debug, Deserialize)]
struct JobLogs {
    job: Job,
}

#[derive(Debug, Deserialize)]
struct GraphListing {
    nodes: Vec<ListedNode>,
    #[serde(default)]
    module_order: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListedNode {
    id: String,
    module: String,
}

pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn is_up(&self) -> bool {
        self.http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    pub async fn start(&self, outputs: &[String], node: Option<&str>) -> Result<Started> {
        let response = self
            .http
            .post(self.url("/api/run"))
            .json(&serde_json::json!({
                "outputs": outputs,
                "nodeId": node,
            }))
            .send()
            .await?;
        decode(response).await
    }

    /// Node ids grouped by module, in the graph's module order.
    pub async fn outputs(&self) -> Result<Vec<(String, Vec<String>)>> {
        let response = self.http.get(self.url("/api/graph")).send().await?;
        let listing: GraphListing = decode(response).await?;

        let mut by_module: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in listing.nodes {
            by_module.entry(node.module).or_default().push(node.id);
        }

        let mut grouped = Vec::with_capacity(by_module.len());
        for module in &listing.module_order {
            if let Some(ids) = by_module.remove(module) {
                grouped.push((module.clone(), ids));
            }
        }
        grouped.extend(by_module);
        Ok(grouped)
    }

    /// Start `outputs` and follow the job to the end, printing what it
    /// prints. Stderr lines go to `err` with a `[stderr]` prefix.
    pub async fn run_job<O, E>(
        &self,
        outputs: &[String],
        node: Option<&str>,
        out: &mut O,
        err: &mut E,
    ) -> Result<Outcome>
    where
        O: Write,
        E: Write,
    {
        let started = self.start(outputs, node).await?;
        writeln!(out, "Job started: {} ({})", started.job_id, started.node_id)?;
        writeln!(out, "{RULE}")?;

        let outcome = match self.follow(&started.job_id, out, err).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                writeln!(out, "[stream ended early, polling for the result]")?;
                self.poll(&started.job_id).await?
            }
            Err(e) => {
                writeln!(out, "[stream interrupted: {e}, polling for the result]")?;
                self.poll(&started.job_id).await?
            }
        };

        writeln!(out, "{RULE}")?;
        writeln!(out, "Status: {}", outcome.status)?;
        if outcome.duration.is_some() {
            writeln!(out, "Duration: {}", format_duration(outcome.duration))?;
        }
        if let Some(message) = &outcome.error_message {
            writeln!(out, "Error: {message}")?;
        }
        Ok(outcome)
    }

    /// Print a job's log events until `complete`.
    ///
    /// Returns `None` if the stream closed first.
    async fn follow<O, E>(&self, job_id: &str, out: &mut O, err: &mut E) -> Result<Option<Outcome>>
    where
        O: Write,
        E: Write,
    {
        let mut response = self
            .http
            .get(self.url(&format!("/api/job/{job_id}/stream")))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(server_error(status, body));
        }

        let mut decoder = SseDecoder::default();
        while let Some(chunk) = response.chunk().await? {
            for event in decoder.push(&chunk) {
                match event.name.as_str() {
                    "log" => {
                        let log: LogPayload = serde_json::from_str(&event.data)?;
                        match log.stream {
                            Stream::Stdout => writeln!(out, "{}", log.line)?,
                            Stream::Stderr => writeln!(err, "[stderr] {}", log.line)?,
                        }
                    }
                    "complete" => return Ok(Some(serde_json::from_str(&event.data)?)),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    /// Read the job's stored row until it is terminal.
    pub async fn poll(&self, job_id: &str) -> Result<Outcome> {
        let deadline = Instant::now() + POLL_TIMEOUT;
        let url = self.url(&format!("/api/history/{job_id}"));
        loop {
            let polled = match self.http.get(&url).send().await {
                Ok(response) => decode::<JobLogs>(response).await,
                Err(e) => Err(e.into()),
            };
            match polled {
                Ok(JobLogs { job }) if job.status.is_terminal() => return Ok(Outcome::from(&job)),
                Ok(_) => {}
                Err(e) => debug!(job = %job_id, error = %e, "poll failed"),
            }

            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(job_id.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(server_error(status.as_u16(), body));
    }
    Ok(serde_json::from_str(&body)?)
}

/// The `error` field of a JSON error body, else the body itself.
fn server_error(status: u16, body: String) -> ClientError {
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    ClientError::Server { status, message }
}

/// One event from a `text/event-stream` body.
#[derive(Debug, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental event-stream parser; chunks may split events anywhere.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().filter(|&&b| b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

/// Comment-only blocks yield nothing.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut name = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if name.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        name: name.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}
