//! Export pipeline orchestration
//!
//! [`ExportPipeline`] runs the four stages of an export in order: extract keys
//! from the input, fetch their records, group them, and write the output file.
//! Fatal errors are wrapped in [`Error::Stage`] naming the stage that failed.
//! The output file is only opened once the fetch has finished, so a run aborted
//! by the backend leaves no output behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;

use crate::aggregate::{Groups, group_records};
use crate::backend::{RecordStore, SqliteStore};
use crate::config::{Config, OutputConfig, OutputLayout};
use crate::error::{Error, Result};
use crate::extract::{dedupe_keys, extract_keys_from_path};
use crate::fetcher::BatchFetcher;
use crate::types::{GroupCount, LookupKey, Record, RunSummary, Stage, WriteMode};
use crate::writer::{TabularWriter, infer_columns};

/// Header of the per-group summary file
const GROUP_SUMMARY_COLUMNS: [&str; 2] = ["group_key", "count"];

/// One configured export run
pub struct ExportPipeline {
    config: Config,
    fetcher: BatchFetcher,
}

/// What the write stage produced
#[derive(Debug, Default)]
struct WriteReport {
    rows_written: usize,
    groups: usize,
    ungrouped: usize,
    group_counts: Vec<GroupCount>,
    group_summary_path: Option<PathBuf>,
}

impl ExportPipeline {
    /// Create a pipeline over an existing store handle
    ///
    /// Validates `config`, including the batch size against the store's limit.
    pub fn new(config: Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        config.validate()?;
        let fetcher = BatchFetcher::new(
            store,
            config.backend.qualified_table(),
            config.fetch.clone(),
            config.retry.clone(),
        )?;
        Ok(Self { config, fetcher })
    }

    /// Create a pipeline over the SQLite reference store at `backend.database_path`
    pub async fn with_sqlite(config: Config) -> Result<Self> {
        let store = SqliteStore::new(&config.backend.database_path).await?;
        Self::new(config, Arc::new(store))
    }

    /// The pipeline's configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where this run writes its output
    ///
    /// The configured `output.path`, or `{output_dir}/{file_prefix}_{YYYY-MM-DD}.csv`
    /// using today's local date.
    pub fn output_path(&self) -> PathBuf {
        let output = &self.config.output;
        match &output.path {
            Some(path) => path.clone(),
            None => output.output_dir.join(format!(
                "{}_{}.csv",
                output.file_prefix,
                Local::now().format("%Y-%m-%d")
            )),
        }
    }

    /// Export the records addressed by the key column of the CSV at `input`
    pub async fn run(&self, input: &Path) -> Result<RunSummary> {
        let started = Instant::now();
        let path = input.to_path_buf();
        let key_column = self.config.input.key_column.clone();
        let delimiter = self.config.input_delimiter();

        let extracted = tokio::task::spawn_blocking(move || {
            extract_keys_from_path(&path, &key_column, delimiter)
        })
        .await
        .map_err(|e| Error::Other(format!("extraction task failed: {e}")).in_stage(Stage::Extract))?
        .map_err(|e| e.in_stage(Stage::Extract))?;

        let summary = RunSummary {
            input_rows: extracted.rows,
            dropped_rows: extracted.dropped,
            ..RunSummary::default()
        };
        self.execute(extracted.keys, summary, started).await
    }

    /// Export the records addressed by `keys`
    pub async fn run_keys(&self, keys: Vec<LookupKey>) -> Result<RunSummary> {
        let summary = RunSummary {
            input_rows: keys.len(),
            ..RunSummary::default()
        };
        self.execute(keys, summary, Instant::now()).await
    }

    async fn execute(
        &self,
        keys: Vec<LookupKey>,
        mut summary: RunSummary,
        started: Instant,
    ) -> Result<RunSummary> {
        summary.input_keys = keys.len();
        let (unique, duplicates) = dedupe_keys(keys);
        summary.duplicate_keys = duplicates;
        summary.unique_keys = unique.len();
        if duplicates > 0 {
            tracing::info!(duplicates, unique = unique.len(), "Removed duplicate keys");
        }

        let fetched = self
            .fetcher
            .fetch(&unique)
            .await
            .map_err(|e| Error::from(e).in_stage(Stage::Fetch))?;

        summary.resolved = fetched.resolved_count();
        summary.missing = fetched.missing.len();
        summary.unresolved = fetched.unresolved.len();
        summary.unresolved_keys = fetched.unresolved;
        summary.timed_out = fetched.timed_out;

        let output_path = self.output_path();
        let output = self.config.output.clone();
        let key_column = self.config.input.key_column.clone();
        let delimiter = self.config.output_delimiter();
        let records = fetched.records;
        let path = output_path.clone();

        let report = tokio::task::spawn_blocking(move || {
            write_output(&records, &output, &key_column, &path, delimiter)
        })
        .await
        .map_err(|e| Error::Other(format!("write task failed: {e}")).in_stage(Stage::Write))??;

        summary.rows_written = report.rows_written;
        summary.groups = report.groups;
        summary.ungrouped = report.ungrouped;
        summary.group_counts = report.group_counts;
        summary.group_summary_path = report.group_summary_path;
        summary.output_path = output_path;
        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !summary.is_complete() {
            tracing::warn!(
                unresolved = summary.unresolved,
                timed_out = summary.timed_out,
                "Export finished with unresolved keys"
            );
        }
        tracing::info!(
            input_keys = summary.input_keys,
            unique_keys = summary.unique_keys,
            resolved = summary.resolved,
            missing = summary.missing,
            unresolved = summary.unresolved,
            groups = summary.groups,
            rows_written = summary.rows_written,
            output = %summary.output_path.display(),
            elapsed_ms = summary.elapsed_ms,
            "Export complete"
        );

        Ok(summary)
    }
}

impl std::fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("config", &self.config)
            .field("fetcher", &self.fetcher)
            .finish()
    }
}

/// Group and write `records`; runs on a blocking thread
fn write_output(
    records: &[Record],
    output: &OutputConfig,
    key_column: &str,
    path: &Path,
    delimiter: u8,
) -> Result<WriteReport> {
    let groups = output
        .group_field
        .as_deref()
        .map(|field| group_records(records, field));

    let mut report = WriteReport::default();
    if let Some(groups) = &groups {
        for group in groups {
            tracing::debug!(group = group.group_key(), count = group.count(), "Group");
        }
        report.groups = groups.len();
        report.ungrouped = groups.skipped();
        report.group_counts = groups.counts();
    }

    let columns = if !output.columns.is_empty() {
        output.columns.clone()
    } else {
        let inferred = infer_columns(records);
        if inferred.is_empty() {
            vec![key_column.to_string()]
        } else {
            inferred
        }
    };

    let mut writer = TabularWriter::open(path, &columns, output.mode, delimiter)
        .map_err(|e| e.in_stage(Stage::Write))?;
    let rows: Box<dyn Iterator<Item = &Record>> = match (&output.layout, &groups) {
        (OutputLayout::Grouped, Some(groups)) => Box::new(groups.records()),
        _ => Box::new(records.iter()),
    };
    for record in rows {
        writer
            .write_record(record)
            .map_err(|e| e.in_stage(Stage::Write))?;
    }
    report.rows_written = writer.finish().map_err(|e| e.in_stage(Stage::Write))?;

    if output.group_summary {
        if let Some(groups) = &groups {
            let summary_path = group_summary_path(path);
            write_group_summary(groups, &summary_path, delimiter)
                .map_err(|e| e.in_stage(Stage::Write))?;
            report.group_summary_path = Some(summary_path);
        }
    }

    Ok(report)
}

/// `{stem}_groups.csv` next to the output file
fn group_summary_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    output.with_file_name(format!("{stem}_groups.csv"))
}

fn write_group_summary(groups: &Groups<'_>, path: &Path, delimiter: u8) -> Result<usize> {
    let columns = GROUP_SUMMARY_COLUMNS.map(String::from);
    let mut writer = TabularWriter::open(path, &columns, WriteMode::Create, delimiter)?;
    for row in groups.summary_rows() {
        writer.write_row(&row)?;
    }
    writer.finish()
}
