//! Artifact discovery: what a node has left on disk.
//!
//! Read-only checks under the project root. Nothing is cached between
//! calls and nothing is ever executed.

mod preview;
mod visualizations;

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::config::DiscoverConfig;

pub use preview::Preview;
pub use visualizations::Visualizations;

/// Table file extensions, in lookup order.
pub const TABLE_EXTENSIONS: [&str; 2] = ["parquet", "csv"];

pub const DEFAULT_PREVIEW_LIMIT: usize = 20;
pub const MAX_PREVIEW_LIMIT: usize = 1000;

/// Errors that can occur while reading an artifact.
#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("no cached data found for {0}")]
    NotFound(String),

    #[error("unsupported table format: {0}")]
    Unsupported(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, DiscoverError>;

/// Per-node badge data for `/api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub has_cached_data: bool,
    pub has_visualizations: bool,
    pub viz_count: usize,
}

/// Filesystem lookups rooted at the project directory.
#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    config: DiscoverConfig,
}

impl Discovery {
    pub fn new(root: impl Into<PathBuf>, config: DiscoverConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Absolute path of the results directory.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join(&self.config.results_dir)
    }

    /// Absolute path of the primary cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.config
            .cache_dirs
            .first()
            .map_or_else(|| self.results_dir().join("cache"), |d| self.root.join(d))
    }

    /// Whether `<cache dir>/<node_id>.<ext>` exists in any cache dir.
    pub fn has_cached_data(&self, node_id: &str) -> bool {
        self.exact_table(node_id).is_some()
    }

    pub fn status(&self, node_id: &str, declared_dir: Option<&str>) -> NodeStatus {
        let viz = self.find_visualizations(node_id, declared_dir);
        NodeStatus {
            has_cached_data: self.has_cached_data(node_id),
            has_visualizations: viz.total_available > 0,
            viz_count: viz.total_available,
        }
    }

    fn exact_table(&self, node_id: &str) -> Option<PathBuf> {
        if !is_plain_name(node_id) {
            return None;
        }
        self.config.cache_dirs.iter().find_map(|dir| {
            TABLE_EXTENSIONS.iter().find_map(|ext| {
                let path = self.root.join(dir).join(format!("{node_id}.{ext}"));
                path.is_file().then_some(path)
            })
        })
    }

    /// `path` relative to the root, with `/` separators.
    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Node ids come from URLs; only accept ones that can't leave a directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Affixes that name a node's artifacts without being part of its subject.
const AFFIXES: [&str; 8] = [
    "plot_", "plots_", "viz_", "chart_", "_plot", "_plots", "_viz", "_chart",
];

/// How well a file or directory name matches a node id.
///
/// `None` means no match. Exact matches beat containment; longer
/// containments beat shorter ones.
fn fuzzy_score(node_id: &str, name: &str) -> Option<usize> {
    let node = normalize(node_id);
    let name = normalize(name);
    if name.len() < 3 {
        return None;
    }

    let stem = strip_affixes(&node);
    if name == node || name == stem {
        return Some(name.len() * 4);
    }
    if node.contains(&name) || name.contains(&node) {
        return Some(name.len() * 2);
    }
    if stem.len() >= 3 && (stem.contains(&name) || name.contains(stem)) {
        return Some(name.len());
    }
    None
}

fn normalize(s: &str) -> String {
    s.to_lowercase().replace('-', "_")
}

fn strip_affixes(s: &str) -> &str {
    let mut s = s;
    for affix in AFFIXES {
        if let Some(rest) = s.strip_prefix(affix) {
            s = rest;
        }
        if let Some(rest) = s.strip_suffix(affix) {
            s = rest;
        }
    }
    s
}
