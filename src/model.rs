//! Core data model for dagboard.
//!
//! Jobs and their log lines are owned by the store.
//! The graph is produced fresh by each introspection.

mod graph;
mod job;

pub use graph::{Graph, GraphNode, Link, ModuleInfo, ReturnKind, Tag};
pub use job::{HistoryPage, HistoryQuery, Job, JobStatus, JobUpdate, LogLine, NodeStats, Stream};
