//! Concatenation of CSV exports sharing one header

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::WriteMode;
use crate::writer::TabularWriter;

/// Outcome of [`merge_exports`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Input files merged
    pub files: usize,
    /// Data rows written to the merged file
    pub rows: usize,
    /// Merged file location
    pub output: PathBuf,
}

/// Merge `inputs` into `output`, writing the shared header once
///
/// Every input must carry the same header as the first one; a mismatch is an
/// [`Error::Input`] naming the offending file. `output` must not be one of the
/// inputs. Both checks run before `output` is opened, so a rejected merge leaves
/// every file untouched. Rows keep file order, then row order within each file.
pub fn merge_exports(inputs: &[PathBuf], output: &Path, delimiter: u8) -> Result<MergeSummary> {
    let Some(first) = inputs.first() else {
        return Err(Error::Input("no export files to merge".to_string()));
    };

    if let Ok(target) = std::fs::canonicalize(output) {
        if let Some(clash) = inputs
            .iter()
            .find(|path| std::fs::canonicalize(path).is_ok_and(|p| p == target))
        {
            return Err(Error::Input(format!(
                "merge output {} is also an input",
                clash.display()
            )));
        }
    }

    let header = read_header(first, delimiter)?;
    for path in &inputs[1..] {
        if read_header(path, delimiter)? != header {
            return Err(Error::Input(format!(
                "header of {} does not match {}",
                path.display(),
                first.display()
            )));
        }
    }

    let mut writer = TabularWriter::open(output, &header, WriteMode::Create, delimiter)?;

    for path in inputs {
        let mut reader = open_reader(path, delimiter)?;
        let before = writer.rows_written();
        for row in reader.records() {
            writer.write_row(row?.iter())?;
        }
        tracing::debug!(
            path = %path.display(),
            rows = writer.rows_written() - before,
            "Merged export file"
        );
    }

    let rows = writer.finish()?;
    tracing::info!(
        files = inputs.len(),
        rows,
        output = %output.display(),
        "Merged export files"
    );

    Ok(MergeSummary {
        files: inputs.len(),
        rows,
        output: output.to_path_buf(),
    })
}

fn open_reader(path: &Path, delimiter: u8) -> Result<csv::Reader<std::fs::File>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Input(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(file))
}

fn read_header(path: &Path, delimiter: u8) -> Result<Vec<String>> {
    let mut reader = open_reader(path, delimiter)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}
