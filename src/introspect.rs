//! Graph introspection: ask the pipeline for its nodes and shape them for the UI.
//!
//! The configured command prints one JSON document describing every node.
//! Everything the UI needs beyond that (badges, return kinds, module colors,
//! layering) is derived here.

mod tags;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    config::GraphConfig,
    model::{Graph, GraphNode, Link, ModuleInfo, ReturnKind},
};

use tags::DirectiveParser;

/// Colors handed to modules in order of first appearance.
const MODULE_COLORS: [&str; 7] = [
    "#0066CC", "#FF9900", "#FF3366", "#4CAF50", "#9333ea", "#06b6d4", "#f43f5e",
];

/// Docs longer than this are cut for display.
const DOC_LIMIT: usize = 300;

/// Errors that can occur while introspecting the graph.
#[derive(Debug, thiserror::Error)]
pub enum IntrospectError {
    #[error("introspection command is empty")]
    EmptyCommand,

    #[error("failed to run introspection command: {0}")]
    Spawn(#[source] io::Error),

    #[error("introspection timed out after {0:?}")]
    Timeout(Duration),

    #[error("introspection exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("introspection reported an error: {0}")]
    Reported(String),

    #[error("invalid introspection output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid directive pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = core::result::Result<T, IntrospectError>;

/// The document the introspection command prints.
#[derive(Debug, Default, Deserialize)]
pub struct RawGraph {
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawNode {
    pub id: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub full_module: Option<String>,
    #[serde(default, alias = "type")]
    pub return_type: Option<String>,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Runs the introspection command and builds graphs from its output.
#[derive(Debug, Clone)]
pub struct Introspector {
    root: PathBuf,
    config: GraphConfig,
    directives: DirectiveParser,
}

impl Introspector {
    pub fn new(root: impl Into<PathBuf>, config: GraphConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(IntrospectError::EmptyCommand);
        }
        Ok(Self {
            root: root.into(),
            config,
            directives: DirectiveParser::new()?,
        })
    }

    /// Run the command in the project root and return the graph.
    pub async fn introspect(&self) -> Result<Graph> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(IntrospectError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.config.timeout();
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| IntrospectError::Timeout(timeout))?
            .map_err(IntrospectError::Spawn)?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            debug!(stderr = %stderr, "introspection wrote to stderr");
        }

        // A script that failed cleanly still prints JSON with an `error`.
        let parsed = serde_json::from_slice::<RawGraph>(&output.stdout);
        if let Ok(RawGraph {
            error: Some(error), ..
        }) = &parsed
        {
            return Err(IntrospectError::Reported(error.clone()));
        }
        if !output.status.success() {
            return Err(IntrospectError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        let graph = self.build(parsed?);
        debug!(
            nodes = graph.nodes.len(),
            links = graph.links.len(),
            max_depth = graph.max_depth,
            "introspected graph"
        );
        Ok(graph)
    }

    /// Shape raw nodes into the served graph.
    pub fn build(&self, raw: RawGraph) -> Graph {
        let mut modules: BTreeMap<String, ModuleInfo> = BTreeMap::new();
        let mut module_order = Vec::new();
        let mut nodes = Vec::new();
        let mut links = Vec::new();

        for node in raw.nodes {
            let full_module = node.full_module.unwrap_or_default();
            let module = node
                .module
                .filter(|m| !m.is_empty())
                .or_else(|| {
                    full_module
                        .rsplit('.')
                        .next()
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "unknown".to_string());

            // Ignored nodes still claim their module's color.
            let module_info = modules
                .entry(module.clone())
                .or_insert_with(|| {
                    let order = module_order.len();
                    module_order.push(module.clone());
                    ModuleInfo {
                        color: MODULE_COLORS[order % MODULE_COLORS.len()].to_string(),
                        order,
                    }
                })
                .clone();

            let doc = node.doc.unwrap_or_default();
            let directives = self.directives.parse(&doc);
            if directives.ignore {
                debug!(node = %node.id, "skipping @ignore node");
                continue;
            }

            let source = if full_module.starts_with("Sandbox") {
                "sandbox"
            } else {
                "production"
            };

            links.extend(node.dependencies.iter().map(|dep| Link {
                source: dep.clone(),
                target: node.id.clone(),
            }));

            nodes.push(GraphNode {
                id: node.id,
                module,
                full_module,
                source: source.to_string(),
                module_info,
                return_type: ReturnKind::classify(node.return_type.as_deref().unwrap_or("")),
                doc: truncate(&doc, DOC_LIMIT),
                dep_count: node.dependencies.len(),
                dependencies: node.dependencies,
                tags: directives.tags,
                depth: 0,
                viz_output: directives.viz_output,
                no_cache: directives.no_cache,
            });
        }

        let depths = layer_depths(&nodes);
        let layered: Vec<u32> = nodes
            .iter()
            .map(|n| depths.get(n.id.as_str()).copied().unwrap_or(0))
            .collect();
        for (node, depth) in nodes.iter_mut().zip(layered) {
            node.depth = depth;
        }
        let max_depth = nodes.iter().map(|n| n.depth).max().unwrap_or(0);

        Graph {
            nodes,
            links,
            modules,
            module_order,
            max_depth,
            title: self.config.title.clone(),
            project: self.config.project.clone(),
            environment: self.config.environment.clone(),
        }
    }
}

/// Topological layer per node: 0 without dependencies, else one past the
/// deepest dependency. A dependency already on the current path counts as 0.
fn layer_depths(nodes: &[GraphNode]) -> HashMap<&str, u32> {
    let deps: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.dependencies.as_slice()))
        .collect();

    let mut memo = HashMap::new();
    for node in nodes {
        let mut path = HashSet::new();
        depth_of(node.id.as_str(), &deps, &mut memo, &mut path);
    }
    memo
}

fn depth_of<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    memo: &mut HashMap<&'a str, u32>,
    path: &mut HashSet<&'a str>,
) -> u32 {
    if let Some(&depth) = memo.get(id) {
        return depth;
    }
    if !path.insert(id) {
        warn!(node = %id, "dependency cycle");
        return 0;
    }

    let depth = match deps.get(id) {
        Some(list) if !list.is_empty() => {
            list.iter()
                .map(|dep| depth_of(dep.as_str(), deps, memo, path))
                .max()
                .unwrap_or(0)
                + 1
        }
        _ => 0,
    };

    path.remove(id);
    memo.insert(id, depth);
    depth
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
