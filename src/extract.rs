//! Lookup key extraction from delimited input
//!
//! Reads a headered CSV stream and yields the values of one designated column
//! as [`LookupKey`]s, in input order. Rows whose key cell is empty or absent,
//! and rows the parser cannot decode, are skipped and counted rather than
//! failing the run.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use indexmap::IndexSet;

use crate::error::{Error, Result};
use crate::types::LookupKey;

/// Keys extracted from one input stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedKeys {
    /// Keys in input order, duplicates included
    pub keys: Vec<LookupKey>,
    /// Data rows read (header excluded)
    pub rows: usize,
    /// Rows skipped: empty or absent key cell, or undecodable row
    pub dropped: usize,
}

/// Extract keys from the `key_column` of a headered CSV stream
///
/// Fails only when the stream cannot be read or its header lacks
/// `key_column`; individual bad rows are dropped.
pub fn extract_keys<R: Read>(reader: R, key_column: &str, delimiter: u8) -> Result<ExtractedKeys> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let key_index = headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == key_column)
        .ok_or_else(|| {
            Error::Input(format!(
                "key column '{}' not found in header ({})",
                key_column,
                headers.iter().collect::<Vec<_>>().join(", ")
            ))
        })?;

    let mut extracted = ExtractedKeys::default();

    for (index, row) in csv_reader.records().enumerate() {
        extracted.rows += 1;
        let row = match row {
            Ok(row) => row,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(row = index + 1, error = %e, "Skipping malformed input row");
                extracted.dropped += 1;
                continue;
            }
        };

        match row.get(key_index).and_then(LookupKey::parse) {
            Some(key) => extracted.keys.push(key),
            None => {
                tracing::trace!(row = index + 1, "Skipping row without a key");
                extracted.dropped += 1;
            }
        }
    }

    if extracted.dropped > 0 {
        tracing::info!(
            dropped = extracted.dropped,
            rows = extracted.rows,
            "Dropped input rows without a usable key"
        );
    }
    tracing::info!(
        keys = extracted.keys.len(),
        column = key_column,
        "Extracted lookup keys"
    );

    Ok(extracted)
}

/// Extract keys from a CSV file on disk
///
/// A missing file is reported as [`Error::Input`].
pub fn extract_keys_from_path(
    path: &Path,
    key_column: &str,
    delimiter: u8,
) -> Result<ExtractedKeys> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::Input(format!("input file not found: {}", path.display()))
        }
        _ => Error::Input(format!("cannot open {}: {}", path.display(), e)),
    })?;
    tracing::info!(path = %path.display(), "Reading lookup keys");
    extract_keys(file, key_column, delimiter)
}

/// Remove duplicate keys, keeping the first occurrence of each
///
/// Returns the distinct keys in first-occurrence order and the number removed.
pub fn dedupe_keys(keys: impl IntoIterator<Item = LookupKey>) -> (Vec<LookupKey>, usize) {
    let mut total = 0;
    let unique: IndexSet<LookupKey> = keys.into_iter().inspect(|_| total += 1).collect();
    let duplicates = total - unique.len();
    (unique.into_iter().collect(), duplicates)
}
