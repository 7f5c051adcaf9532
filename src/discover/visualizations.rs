//! Finding a node's rendered images.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ignore::WalkBuilder;
use serde::Serialize;
use tracing::debug;

use super::{Discovery, fuzzy_score, is_plain_name};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "svg", "gif", "webp"];

/// How deep below the output directory images are looked for.
const MAX_DEPTH: usize = 3;

/// What `/api/visualizations/{nodeId}` reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Visualizations {
    /// Image paths relative to the root, best first, capped.
    pub images: Vec<String>,

    /// Parquet files sitting next to the images.
    pub parquets: Vec<String>,

    /// Images found before capping.
    pub total_available: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

impl Discovery {
    /// Locate a node's images.
    ///
    /// Looks in the declared directory first, then `results/<node_id>/`,
    /// then the closest-named subdirectory of `results/`.
    pub fn find_visualizations(&self, node_id: &str, declared_dir: Option<&str>) -> Visualizations {
        let Some(dir) = self.output_dir(node_id, declared_dir) else {
            return Visualizations::default();
        };

        let (mut images, mut parquets) = (Vec::new(), Vec::new());
        for path in walk_files(&dir, MAX_DEPTH) {
            let Some(ext) = extension(&path) else {
                continue;
            };
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                images.push(self.relative(&path));
            } else if ext == "parquet" {
                parquets.push(self.relative(&path));
            }
        }

        sort_images(&mut images);
        let total_available = images.len();
        images.truncate(self.config.max_images);
        parquets.sort();

        debug!(node = %node_id, dir = %dir.display(), total_available, "found visualizations");
        Visualizations {
            images,
            parquets,
            total_available,
            output_dir: Some(self.relative(&dir)),
        }
    }

    fn output_dir(&self, node_id: &str, declared_dir: Option<&str>) -> Option<PathBuf> {
        if let Some(declared) = declared_dir {
            let dir = self.root.join(declared.trim().trim_end_matches('/'));
            if dir.is_dir() {
                return Some(dir);
            }
        }

        if !is_plain_name(node_id) {
            return None;
        }

        let results = self.results_dir();
        let conventional = results.join(node_id);
        if conventional.is_dir() {
            return Some(conventional);
        }

        // Closest-named subdirectory; ties go to the first name.
        let mut best: Option<(usize, String)> = None;
        for entry in fs::read_dir(&results).ok()?.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "cache" || name.starts_with('.') {
                continue;
            }
            let Some(score) = fuzzy_score(node_id, &name) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((s, n)) => score > *s || (score == *s && name < *n),
            };
            if better {
                best = Some((score, name));
            }
        }
        best.map(|(_, name)| results.join(name))
    }
}

/// Files under `dir`, no deeper than `max_depth`, skipping hidden entries.
///
/// Ignore files are not honored: results are usually gitignored.
pub(super) fn walk_files(dir: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(dir);
    builder
        .standard_filters(false)
        .max_depth(Some(max_depth))
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });

    builder
        .build()
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(ignore::DirEntry::into_path)
        .collect()
}

pub(super) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// "combined" images first, then newest-looking names first.
fn sort_images(images: &mut [String]) {
    images.sort_by(|a, b| {
        let a_combined = a.to_lowercase().contains("combined");
        let b_combined = b.to_lowercase().contains("combined");
        b_combined.cmp(&a_combined).then_with(|| b.cmp(a))
    });
}
