//! Graph types: the introspected dependency graph as served to the UI.
//!
//! The graph is recomputed on every introspection and never mutated here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The full dependency graph, in the shape the renderer consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<Link>,
    pub modules: BTreeMap<String, ModuleInfo>,
    pub module_order: Vec<String>,
    pub max_depth: u32,
    pub title: String,
    pub project: String,
    pub environment: String,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A named computation in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub module: String,
    pub full_module: String,

    /// `production` or `sandbox`, from the module path.
    pub source: String,

    pub module_info: ModuleInfo,
    pub return_type: ReturnKind,
    pub doc: String,
    pub dependencies: Vec<String>,
    pub dep_count: usize,
    pub tags: Vec<Tag>,

    /// Topological layer: 0 for nodes without in-graph dependencies.
    pub depth: u32,

    /// Directory declared with `@viz_output:` in the node's doc.
    pub viz_output: Option<String>,

    /// Declared with `@no_cache`: the engine does not persist its table.
    pub no_cache: bool,
}

/// A dependency edge, `source` feeds `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source: String,
    pub target: String,
}

/// Display color and position of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub color: String,
    pub order: usize,
}

/// A classification badge shown on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub color: String,
}

impl Tag {
    pub fn new(label: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            color: color.into(),
        }
    }
}

/// What a node returns, decided once from the raw type name.
///
/// Serialized as the short label the UI shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ReturnKind {
    Table,
    Connection,
    Mapping,
    Text,
    Path,
    Other(String),
}

impl ReturnKind {
    /// Classify a raw type name such as `<class 'pandas.DataFrame'>`.
    ///
    /// Checks run in a fixed order, so `Dict[str, DataFrame]` is a table.
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Other("Any".to_string());
        }
        if raw.contains("DataFrame") {
            Self::Table
        } else if raw.contains("Database") || raw.contains("DataSource") {
            Self::Connection
        } else if raw.contains("Dict") || raw.contains("dict") {
            Self::Mapping
        } else if raw.contains("str") {
            Self::Text
        } else if raw.contains("Path") {
            Self::Path
        } else {
            Self::Other(raw.to_string())
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Table => "DataFrame",
            Self::Connection => "Connection",
            Self::Mapping => "Dict",
            Self::Text => "String",
            Self::Path => "Path",
            Self::Other(raw) => raw,
        }
    }
}

impl From<ReturnKind> for String {
    fn from(kind: ReturnKind) -> Self {
        kind.label().to_string()
    }
}

impl From<String> for ReturnKind {
    fn from(label: String) -> Self {
        match label.as_str() {
            "DataFrame" => Self::Table,
            "Connection" => Self::Connection,
            "Dict" => Self::Mapping,
            "String" => Self::Text,
            "Path" => Self::Path,
            _ => Self::Other(label),
        }
    }
}
