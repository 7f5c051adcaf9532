//! Previewing a node's cached table.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    csv::{ReaderBuilder, reader::Format},
    datatypes::{DataType, Field, Schema, SchemaRef},
    json::{WriterBuilder, writer::JsonArray},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    DiscoverError, Discovery, Result, TABLE_EXTENSIONS, fuzzy_score, is_plain_name,
    visualizations::{extension, walk_files},
};

/// Rows sampled to infer CSV column types.
const CSV_INFER_ROWS: usize = 1000;

/// What `/api/preview/{nodeId}` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Preview {
    Table(TablePreview),
    Missing { cached: bool, error: String },
}

impl Preview {
    fn missing(error: impl Into<String>) -> Self {
        Self::Missing {
            cached: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TablePreview {
    pub cached: bool,

    /// Relative to the project root.
    pub path: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Map<String, Value>>,

    /// `[total rows, columns]` of the whole file.
    pub shape: [u64; 2],
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub dtype: String,
}

impl Discovery {
    /// Read the first `limit` rows of a node's cached table.
    ///
    /// Misses and unreadable files are reported in the preview, not as
    /// errors.
    pub fn preview_cached_table(&self, node_id: &str, limit: usize) -> Preview {
        let Some(path) = self.find_table(node_id) else {
            return Preview::missing(DiscoverError::NotFound(node_id.to_string()).to_string());
        };

        match read_table(&path, limit) {
            Ok((schema, rows, total)) => {
                debug!(node = %node_id, path = %path.display(), total, "previewed table");
                Preview::Table(TablePreview {
                    cached: true,
                    path: self.relative(&path),
                    columns: schema
                        .fields()
                        .iter()
                        .map(|f| Column {
                            name: f.name().clone(),
                            dtype: f.data_type().to_string(),
                        })
                        .collect(),
                    shape: [total, schema.fields().len() as u64],
                    rows,
                    limit,
                })
            }
            Err(e) => {
                warn!(node = %node_id, path = %path.display(), error = %e, "failed to read cached table");
                Preview::missing(e.to_string())
            }
        }
    }

    /// The exact cache file, else the closest-named table under the cache
    /// and results directories.
    fn find_table(&self, node_id: &str) -> Option<PathBuf> {
        if let Some(path) = self.exact_table(node_id) {
            return Some(path);
        }
        if !is_plain_name(node_id) {
            return None;
        }

        let mut roots: Vec<PathBuf> = self
            .config
            .cache_dirs
            .iter()
            .map(|d| self.root.join(d))
            .collect();
        roots.push(self.results_dir());

        let mut best: Option<(usize, PathBuf)> = None;
        for root in roots.iter().filter(|r| r.is_dir()) {
            for path in walk_files(root, 3) {
                let is_table = extension(&path)
                    .is_some_and(|ext| TABLE_EXTENSIONS.contains(&ext.as_str()));
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                    continue;
                };
                if !is_table {
                    continue;
                }
                let Some(score) = fuzzy_score(node_id, &stem) else {
                    continue;
                };
                if best.as_ref().is_none_or(|(s, _)| score > *s) {
                    best = Some((score, path));
                }
            }
        }
        best.map(|(_, path)| path)
    }
}

type TableSample = (SchemaRef, Vec<Map<String, Value>>, u64);

fn read_table(path: &Path, limit: usize) -> Result<TableSample> {
    match extension(path).as_deref() {
        Some("parquet") => read_parquet(path, limit),
        Some("csv") => read_csv(path, limit),
        _ => Err(DiscoverError::Unsupported(path.to_path_buf())),
    }
}

fn read_parquet(path: &Path, limit: usize) -> Result<TableSample> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let total = u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or_default();
    let schema = Arc::clone(builder.schema());

    let reader = builder
        .with_batch_size(limit.max(1))
        .with_limit(limit)
        .build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((schema, to_rows(&batches, limit)?, total))
}

fn read_csv(path: &Path, limit: usize) -> Result<TableSample> {
    let format = Format::default().with_header(true);
    let mut file = File::open(path)?;
    let (inferred, _) = format.infer_schema(&mut file, Some(CSV_INFER_ROWS))?;
    let typed = Arc::new(inferred);
    let text = as_text(&typed);

    // Inference only sees the head of the file. A value it never saw
    // makes the typed read fail, so the sample falls back to text.
    let (schema, kept) = match csv_head(path, &typed, &format, limit) {
        Ok(kept) => (typed, kept),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "typed csv read failed, sampling as text");
            let kept = csv_head(path, &text, &format, limit)?;
            (Arc::clone(&text), kept)
        }
    };
    let total = count_csv_rows(path, &text, &format)?;

    Ok((schema, to_rows(&kept, limit)?, total))
}

/// The first `limit` rows, decoded with `schema`.
fn csv_head(
    path: &Path,
    schema: &SchemaRef,
    format: &Format,
    limit: usize,
) -> Result<Vec<RecordBatch>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let reader = ReaderBuilder::new(Arc::clone(schema))
        .with_format(format.clone())
        .with_batch_size(limit)
        .build(File::open(path)?)?;
    Ok(reader
        .take(1)
        .collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Counts records with every column read as text, so no value can fail.
fn count_csv_rows(path: &Path, text: &SchemaRef, format: &Format) -> Result<u64> {
    let reader = ReaderBuilder::new(Arc::clone(text))
        .with_format(format.clone())
        .build(File::open(path)?)?;
    let mut total = 0u64;
    for batch in reader {
        total += batch?.num_rows() as u64;
    }
    Ok(total)
}

fn as_text(schema: &SchemaRef) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Rows as JSON objects, nulls kept.
fn to_rows(batches: &[RecordBatch], limit: usize) -> Result<Vec<Map<String, Value>>> {
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;

    let buf = writer.into_inner();
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let mut rows: Vec<Map<String, Value>> = serde_json::from_slice(&buf)?;
    rows.truncate(limit);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use arrow::array::{Int64Array, StringArray};
    use parquet::arrow::ArrowWriter;
    use tempfile::TempDir;

    use crate::config::DiscoverConfig;

    fn discovery() -> (TempDir, Discovery) {
        let dir = TempDir::new().unwrap();
        let discovery = Discovery::new(dir.path(), DiscoverConfig::default());
        (dir, discovery)
    }

    fn write_parquet(path: &Path, rows: i64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let schema = Arc::new(Schema::new(vec![
            Field::new("age", DataType::Int64, false),
            Field::new("group", DataType::Utf8, true),
        ]));
        let ages = Int64Array::from((0..rows).collect::<Vec<_>>());
        let groups = StringArray::from(
            (0..rows)
                .map(|i| (i % 2 == 0).then(|| format!("g{i}")))
                .collect::<Vec<_>>(),
        );
        let batch =
            RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(ages), Arc::new(groups)])
                .unwrap();

        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn parquet_preview_is_limited_but_shaped_by_the_whole_file() {
        let (dir, discovery) = discovery();
        write_parquet(&dir.path().join("results/cache/cohort.parquet"), 50);

        let Preview::Table(table) = discovery.preview_cached_table("cohort", 20) else {
            panic!("expected a table");
        };

        assert!(table.cached);
        assert_eq!(table.path, "results/cache/cohort.parquet");
        assert_eq!(table.shape, [50, 2]);
        assert_eq!(table.rows.len(), 20);
        assert_eq!(table.limit, 20);
        assert_eq!(table.columns, [
            Column {
                name: "age".into(),
                dtype: "Int64".into()
            },
            Column {
                name: "group".into(),
                dtype: "Utf8".into()
            },
        ]);
        assert_eq!(table.rows[0]["age"], 0);
        assert_eq!(table.rows[0]["group"], "g0");
        assert!(table.rows[1]["group"].is_null());
    }

    #[test]
    fn csv_preview_infers_types() {
        let (dir, discovery) = discovery();
        let path = dir.path().join("data/processed/readmissions.csv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut csv = String::from("age_band,rate\n");
        for i in 0..30 {
            csv.push_str(&format!("band{i},{i}.5\n"));
        }
        fs::write(&path, csv).unwrap();

        let Preview::Table(table) = discovery.preview_cached_table("readmissions", 5) else {
            panic!("expected a table");
        };

        assert_eq!(table.shape, [30, 2]);
        assert_eq!(table.rows.len(), 5);
        assert_eq!(table.columns[1].dtype, "Float64");
        assert_eq!(table.rows[4]["age_band"], "band4");
        assert_eq!(table.rows[4]["rate"], 4.5);
    }

    fn write_csv_with_late_text(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut csv = String::from("id,value\n");
        for i in 0..1500 {
            csv.push_str(&format!("{i},{}\n", i * 2));
        }
        csv.push_str("1500,n/a\n");
        fs::write(path, csv).unwrap();
    }

    #[test]
    fn csv_value_past_inference_window_still_previews() {
        let (dir, discovery) = discovery();
        write_csv_with_late_text(&dir.path().join("results/cache/cohort.csv"));

        let Preview::Table(table) = discovery.preview_cached_table("cohort", 5) else {
            panic!("expected a table");
        };

        assert!(table.cached);
        assert_eq!(table.shape, [1501, 2]);
        assert_eq!(table.rows.len(), 5);
        assert_eq!(table.columns[1].dtype, "Int64");
        assert_eq!(table.rows[4]["value"], 8);
    }

    #[test]
    fn csv_sample_reaching_odd_value_falls_back_to_text() {
        let (dir, discovery) = discovery();
        write_csv_with_late_text(&dir.path().join("results/cache/cohort.csv"));

        let Preview::Table(table) = discovery.preview_cached_table("cohort", 1501) else {
            panic!("expected a table");
        };

        assert_eq!(table.shape, [1501, 2]);
        assert_eq!(table.rows.len(), 1501);
        assert_eq!(table.columns[1].dtype, "Utf8");
        assert_eq!(table.rows[1500]["value"], "n/a");
        assert_eq!(table.rows[0]["value"], "0");
    }

    #[test]
    fn fuzzy_match_finds_nearby_tables() {
        let (dir, discovery) = discovery();
        write_parquet(&dir.path().join("results/age_study/readmission_by_age.parquet"), 3);

        let Preview::Table(table) = discovery.preview_cached_table("plot_readmission_by_age", 10)
        else {
            panic!("expected a table");
        };

        assert_eq!(table.path, "results/age_study/readmission_by_age.parquet");
        assert_eq!(table.rows.len(), 3);
    }

    #[test]
    fn miss_is_reported_not_raised() {
        let (_dir, discovery) = discovery();

        let preview = discovery.preview_cached_table("nothing", 20);

        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["cached"], false);
        assert!(json["error"].as_str().unwrap().contains("nothing"));
    }

    #[test]
    fn unreadable_file_is_a_miss() {
        let (dir, discovery) = discovery();
        let path = dir.path().join("results/cache/broken.parquet");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"definitely not parquet").unwrap();

        let preview = discovery.preview_cached_table("broken", 20);

        assert!(matches!(preview, Preview::Missing { cached: false, .. }));
    }

    #[test]
    fn zero_limit_returns_shape_only() {
        let (dir, discovery) = discovery();
        write_parquet(&dir.path().join("results/cache/empty_rows.parquet"), 4);

        let Preview::Table(table) = discovery.preview_cached_table("empty_rows", 0) else {
            panic!("expected a table");
        };

        assert!(table.rows.is_empty());
        assert_eq!(table.shape, [4, 2]);
    }
}
