//! Doc-comment directives and keyword badges.
//!
//! A node's doc can carry `@`-directives that change how it's shown or
//! handled. Keywords in the prose add further badges.

use regex::{Regex, RegexBuilder};

use crate::model::Tag;

const ASSET: &str = "#f59e0b";
const LOCATION: &str = "#06b6d4";
const VIZ: &str = "#ec4899";
const GRAY: &str = "#6b7280";
const SYNC: &str = "#22c55e";
const LOCAL: &str = "#f97316";
const DB: &str = "#3b82f6";
const EXTERNAL: &str = "#8b5cf6";
const PARQUET: &str = "#22c55e";

/// What a doc comment declares about its node.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Directives {
    /// `@ignore`: the node is left out of the graph.
    pub ignore: bool,
    pub viz_output: Option<String>,
    pub no_cache: bool,
    pub tags: Vec<Tag>,
}

/// Compiled directive patterns, built once per introspector.
#[derive(Debug, Clone)]
pub struct DirectiveParser {
    ignore: Regex,
    asset: Regex,
    location: Regex,
    viz_output: Regex,
    no_cache: Regex,
    sync: Regex,
    local: Regex,
    custom: Regex,
}

impl DirectiveParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            ignore: insensitive(r"@ignore\b")?,
            asset: insensitive(r"@asset")?,
            location: insensitive(r"@location:\s*([^\n]+)")?,
            viz_output: insensitive(r"@viz_output:\s*([^\n]+)")?,
            no_cache: insensitive(r"@no_cache\b")?,
            sync: insensitive(r"@sync\b")?,
            local: insensitive(r"@local\b")?,
            custom: Regex::new(r"@tag:\s*(\S+)(?:\s+(#[0-9a-fA-F]{6}))?")?,
        })
    }

    pub fn parse(&self, doc: &str) -> Directives {
        if self.ignore.is_match(doc) {
            return Directives {
                ignore: true,
                ..Directives::default()
            };
        }

        let mut tags = Vec::new();

        if self.asset.is_match(doc) {
            tags.push(Tag::new("Asset", ASSET));
        }
        if self.location.is_match(doc) {
            tags.push(Tag::new("Location", LOCATION));
        }

        let viz_output = self
            .viz_output
            .captures(doc)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        if viz_output.is_some() {
            tags.push(Tag::new("Viz", VIZ));
        }

        let no_cache = self.no_cache.is_match(doc);
        if no_cache {
            tags.push(Tag::new("No Cache", GRAY));
        }
        if self.sync.is_match(doc) {
            tags.push(Tag::new("Sync", SYNC));
        }
        if self.local.is_match(doc) {
            tags.push(Tag::new("Local", LOCAL));
        }

        keyword_tags(doc, &mut tags);

        for caps in self.custom.captures_iter(doc) {
            let label = &caps[1];
            let color = caps.get(2).map_or(GRAY, |m| m.as_str());
            tags.push(Tag::new(label, color));
        }

        Directives {
            ignore: false,
            viz_output,
            no_cache,
            tags,
        }
    }
}

fn insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Badges inferred from the prose itself.
fn keyword_tags(doc: &str, tags: &mut Vec<Tag>) {
    let lower = doc.to_lowercase();
    let has = |word: &str| lower.contains(word);

    if has("postgresql") || has("database") || (has("import") && has("from")) {
        tags.push(Tag::new("DB", DB));
    }
    if has("download") || has("fetch") || has("http") {
        tags.push(Tag::new("External", EXTERNAL));
    }
    if has("parquet") || has("save") {
        tags.push(Tag::new("Parquet", PARQUET));
    }
    if !tags.iter().any(|t| t.label == "Viz") && (has("figure") || has("plot") || has("visual"))
    {
        tags.push(Tag::new("Viz", VIZ));
    }
}
