//! Command-line interface for dagboard.
//!
//! `serve` runs the HTTP API for a project. `run` starts jobs on a running
//! server and follows them. `history` and `graph` read the same store and
//! introspection command from the terminal, without a server.

mod client;
mod format;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    api::{self, AppState},
    config::Config,
    discover::Discovery,
    introspect::Introspector,
    model::{HistoryQuery, JobStatus},
    runner::JobRunner,
    storage::Storage,
    stream::StreamSettings,
};

/// How long shutdown waits for running jobs to be recorded.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Recorded on jobs a previous server left `running`.
const ORPHAN_MESSAGE: &str = "server restarted before the job finished";

/// dagboard: run and watch a pipeline's dependency graph.
#[derive(Debug, Parser)]
#[command(name = "dagboard", version, after_long_help = USAGE_HELP)]
pub struct Cli {
    /// Project root. Commands run here and artifacts are found here.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file to use instead of the project and user ones.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

const USAGE_HELP: &str = r"Examples:
  dagboard serve --port 5050
  dagboard run --outputs cohort readmission_by_age
  dagboard run --list
  dagboard --root ~/pipelines/readmissions history --node cohort --status failed
  dagboard graph > graph.json

Config is read from --config, else <root>/.dagboard/config.toml, else the
user config directory (dagboard/config.toml).";

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Overrides `server.host`.
        #[arg(long)]
        host: Option<String>,

        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run outputs on a running server and print their output.
    ///
    /// Exits with the engine's exit code.
    Run {
        /// Outputs to compute.
        #[arg(long, num_args = 1.., required_unless_present = "list")]
        outputs: Vec<String>,

        /// Primary node recorded for the job. Defaults to the first output.
        #[arg(long)]
        node: Option<String>,

        /// Server URL. Defaults to `server.host` and `server.port`.
        #[arg(long)]
        server: Option<String>,

        /// List the graph's outputs by module instead of running.
        #[arg(long, conflicts_with = "outputs")]
        list: bool,
    },

    /// List recent jobs, most recent first.
    History {
        /// Only jobs whose primary node is this one.
        #[arg(long)]
        node: Option<String>,

        /// Only jobs in this state: running, completed or failed.
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Introspect the project and print the graph as JSON.
    Graph,
}

/// Run the CLI, returning the process exit code or an error message.
pub async fn run(cli: Cli) -> Result<i32, String> {
    let root = cli
        .root
        .canonicalize()
        .map_err(|e| format!("invalid project root {}: {e}", cli.root.display()))?;
    let config = Config::load(&root, cli.config.as_deref()).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Serve { host, port } => cmd_serve(&root, config, host, port).await.map(|()| 0),
        Command::Run {
            outputs,
            node,
            server,
            list,
        } => {
            let server = server.unwrap_or_else(|| server_url(&config));
            cmd_run(&server, &outputs, node.as_deref(), list).await
        }
        Command::History {
            node,
            status,
            limit,
        } => cmd_history(&root, &config, node, status, limit).map(|()| 0),
        Command::Graph => cmd_graph(&root, config).await.map(|()| 0),
    }
}

/// Where `run` finds the server; a wildcard bind is reached on loopback.
fn server_url(config: &Config) -> String {
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        host => host,
    };
    format!("http://{host}:{}", config.server.port)
}

fn open_storage(root: &Path, config: &Config) -> Result<Storage, String> {
    let path = config.store_path(root);
    let storage = Storage::open(&path, config.store.retention)
        .map_err(|e| format!("failed to open store {}: {e}", path.display()))?;
    if let Some(quarantined) = storage.recovered_from() {
        warn!(
            quarantined = %quarantined.display(),
            "store was corrupt; started a fresh one"
        );
    }
    Ok(storage)
}

async fn cmd_serve(
    root: &Path,
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), String> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let storage = Arc::new(open_storage(root, &config)?);
    let orphans = storage
        .fail_orphaned_jobs(ORPHAN_MESSAGE)
        .map_err(|e| format!("failed to reconcile interrupted jobs: {e}"))?;
    if orphans > 0 {
        warn!(orphans, "marked interrupted jobs as failed");
    }

    let discovery = Discovery::new(root, config.discover.clone());
    let runner = JobRunner::new(
        Arc::clone(&storage),
        root,
        discovery.cache_dir(),
        &config.runner,
    )
    .map_err(|e| format!("invalid runner config: {e}"))?;
    let introspector = Introspector::new(root, config.graph.clone())
        .map_err(|e| format!("invalid graph config: {e}"))?;
    let state = AppState::new(
        Arc::clone(&storage),
        runner.clone(),
        introspector,
        discovery,
        StreamSettings::from(&config.stream),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!(
        root = %root.display(),
        store = %storage.path().display(),
        retention = storage.retention(),
        "dagboard ready"
    );

    // Jobs are stopped before the server drains, so open streams can end.
    let stopping = {
        let runner = runner.clone();
        async move {
            shutdown_signal().await;
            runner.shutdown();
        }
    };
    api::serve(listener, state, stopping)
        .await
        .map_err(|e| format!("server error: {e}"))?;

    if !runner.wait_idle(DRAIN_TIMEOUT).await {
        warn!(timeout = ?DRAIN_TIMEOUT, "jobs still running at exit");
    }
    drop(runner);

    match Arc::try_unwrap(storage) {
        Ok(storage) => storage
            .close()
            .map_err(|e| format!("failed to close store: {e}"))?,
        Err(_) => warn!("store still in use at exit; leaving it to drop"),
    }
    info!("shut down");
    Ok(())
}

async fn cmd_run(
    server: &str,
    outputs: &[String],
    node: Option<&str>,
    list: bool,
) -> Result<i32, String> {
    let client = client::Client::new(server);
    if !client.is_up().await {
        return Err(format!(
            "no dagboard server at {server}; start one with `dagboard serve`"
        ));
    }

    if list {
        let grouped = client
            .outputs()
            .await
            .map_err(|e| format!("failed to load the graph: {e}"))?;
        for (module, ids) in grouped {
            println!("{module}:");
            for id in ids {
                println!("  - {id}");
            }
        }
        return Ok(0);
    }

    let (mut out, mut err) = (std::io::stdout(), std::io::stderr());
    tokio::select! {
        outcome = client.run_job(outputs, node, &mut out, &mut err) => {
            let outcome = outcome.map_err(|e| format!("run failed: {e}"))?;
            Ok(outcome.process_code())
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted; the job keeps running on the server");
            Ok(130)
        }
    }
}

fn cmd_history(
    root: &Path,
    config: &Config,
    node: Option<String>,
    status: Option<JobStatus>,
    limit: usize,
) -> Result<(), String> {
    let storage = open_storage(root, config)?;
    let page = storage
        .get_history(&HistoryQuery {
            node_id: node,
            status,
            limit,
            offset: 0,
        })
        .map_err(|e| format!("failed to read history: {e}"))?;

    if page.jobs.is_empty() {
        println!("No jobs recorded.");
        return Ok(());
    }

    for job in &page.jobs {
        println!("{}", format::job_row(job));
    }
    if page.has_more {
        let shown = u64::try_from(page.jobs.len()).unwrap_or(u64::MAX);
        println!("... and {} more", page.total.saturating_sub(shown));
    }
    Ok(())
}

async fn cmd_graph(root: &Path, config: Config) -> Result<(), String> {
    let introspector =
        Introspector::new(root, config.graph).map_err(|e| format!("invalid graph config: {e}"))?;
    let graph = introspector
        .introspect()
        .await
        .map_err(|e| format!("introspection failed: {e}"))?;

    let json = serde_json::to_string_pretty(&graph)
        .map_err(|e| format!("failed to encode graph: {e}"))?;
    println!("{json}");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
}
