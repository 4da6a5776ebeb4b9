//! Streaming CSV output
//!
//! [`TabularWriter`] is the single writer contract used for record exports,
//! group summaries and merged exports. Rows are streamed through a buffered
//! `csv::Writer`; nothing is accumulated in memory.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use csv::QuoteStyle;
use indexmap::IndexSet;

use crate::error::{Error, Result};
use crate::types::{Record, WriteMode, render_value};

/// Fixed-shape projection of a record onto output columns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRow {
    /// Rendered cell values, one per column
    pub values: Vec<String>,
}

impl OutputRow {
    /// Project `record` onto `columns`; absent fields and nulls become empty cells
    pub fn project(record: &Record, columns: &[String]) -> Self {
        let values = columns
            .iter()
            .map(|column| record.get(column).and_then(render_value).unwrap_or_default())
            .collect();
        Self { values }
    }
}

/// Column set covering every field of `records`, in first-seen order
pub fn infer_columns<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<String> {
    let mut columns = IndexSet::new();
    for record in records {
        for name in record.fields.keys() {
            if !columns.contains(name.as_str()) {
                columns.insert(name.clone());
            }
        }
    }
    columns.into_iter().collect()
}

/// Row-by-row CSV writer bound to one destination file
///
/// Dropping the writer without calling [`finish`](Self::finish) still flushes
/// best-effort; whatever was written stays on disk.
pub struct TabularWriter {
    inner: csv::Writer<File>,
    path: PathBuf,
    columns: Vec<String>,
    rows_written: usize,
}

impl TabularWriter {
    /// Open `path` for writing
    ///
    /// `Create` truncates and writes the header. `Append` writes rows only,
    /// except when the file is missing or empty, in which case the header is
    /// written first. Parent directories are created as needed.
    pub fn open(path: &Path, columns: &[String], mode: WriteMode, delimiter: u8) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| destination_error(path, e))?;
        }

        let (file, write_header) = match mode {
            WriteMode::Create => {
                let file = File::create(path).map_err(|e| destination_error(path, e))?;
                (file, true)
            }
            WriteMode::Append => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| destination_error(path, e))?;
                let existing = file
                    .metadata()
                    .map_err(|e| destination_error(path, e))?
                    .len();
                (file, existing == 0)
            }
        };

        let inner = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .quote_style(QuoteStyle::Necessary)
            .has_headers(false)
            .from_writer(file);

        let mut writer = Self {
            inner,
            path: path.to_path_buf(),
            columns: columns.to_vec(),
            rows_written: 0,
        };

        if write_header {
            writer
                .inner
                .write_record(&writer.columns)
                .map_err(|e| destination_error(&writer.path, e))?;
        }

        tracing::debug!(
            path = %path.display(),
            ?mode,
            columns = columns.len(),
            header = write_header,
            "Opened output file"
        );

        Ok(writer)
    }

    /// Destination file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Output columns, in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Data rows written so far (header excluded)
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Write one record, projected onto the writer's columns
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let row = OutputRow::project(record, &self.columns);
        self.write_row(&row.values)
    }

    /// Write one row of pre-rendered cells
    pub fn write_row<I, T>(&mut self, cells: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.inner
            .write_record(cells)
            .map_err(|e| destination_error(&self.path, e))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush buffered rows and close the file, returning the data row count
    pub fn finish(mut self) -> Result<usize> {
        self.inner
            .flush()
            .map_err(|e| destination_error(&self.path, e))?;
        tracing::debug!(
            path = %self.path.display(),
            rows = self.rows_written,
            "Closed output file"
        );
        Ok(self.rows_written)
    }
}

impl std::fmt::Debug for TabularWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularWriter")
            .field("path", &self.path)
            .field("columns", &self.columns)
            .field("rows_written", &self.rows_written)
            .finish()
    }
}

/// Write `records` to `path` in one call, returning the data row count
pub fn write_records<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    columns: &[String],
    path: &Path,
    mode: WriteMode,
    delimiter: u8,
) -> Result<usize> {
    let mut writer = TabularWriter::open(path, columns, mode, delimiter)?;
    for record in records {
        writer.write_record(record)?;
    }
    writer.finish()
}

pub(crate) fn destination_error(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::DestinationWrite {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
