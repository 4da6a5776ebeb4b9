//! Core types for keyset-export

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Identifier addressing exactly one record in the backend
///
/// Keys are opaque and never blank. The raw value is kept as given, surrounding
/// whitespace included.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LookupKey(String);

impl LookupKey {
    /// Parse a key, returning `None` for empty or whitespace-only input
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw.to_string()))
        }
    }

    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the owned string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LookupKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for LookupKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LookupKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "lookup key must not be empty".to_string())
    }
}

impl TryFrom<&str> for LookupKey {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value).ok_or_else(|| "lookup key must not be empty".to_string())
    }
}

impl From<LookupKey> for String {
    fn from(key: LookupKey) -> Self {
        key.0
    }
}

/// Field name → value mapping of a record, in backend field order
pub type Fields = IndexMap<String, Value>;

/// One record returned by the backend for one key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key the record was addressed by
    pub key: LookupKey,
    /// Record attributes, including the key attribute itself
    pub fields: Fields,
}

impl Record {
    /// Create a record from its key and fields
    pub fn new(key: LookupKey, fields: Fields) -> Self {
        Self { key, fields }
    }

    /// Raw value of a field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Text rendering of a field, `None` when absent or null
    pub fn text(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(render_value)
    }
}

/// Render a field value as flat text.
///
/// Strings are returned verbatim, numbers and booleans use their display form,
/// arrays and objects are serialized as compact JSON. Null renders as `None`.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Ordered subset of keys submitted to the backend in one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based position of this batch within the fetch
    pub index: usize,
    /// Keys in submission order
    pub keys: Vec<LookupKey>,
}

impl Batch {
    /// Number of keys in the batch
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the batch holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Outcome of a complete batched fetch
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FetchResult {
    /// Resolved records, in key extraction order
    pub records: Vec<Record>,
    /// Keys still unresolved after retries were exhausted (or the time budget expired)
    pub unresolved: Vec<LookupKey>,
    /// Keys the backend processed but holds no record for
    pub missing: Vec<LookupKey>,
    /// Number of batches the key set was partitioned into
    pub batches: usize,
    /// Total batch-get calls issued, retries included
    pub backend_calls: usize,
    /// Whether the fetch stopped early because its wall-clock budget expired
    pub timed_out: bool,
}

impl FetchResult {
    /// Number of keys that resolved to a record
    pub fn resolved_count(&self) -> usize {
        self.records.len()
    }

    /// Whether every key was either resolved or confirmed missing
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// How rows are written to an existing destination
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Truncate the destination and write a header row first (default)
    #[default]
    Create,
    /// Append data rows only
    Append,
}

/// Pipeline stage, used to attribute fatal errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Reading the input and extracting keys
    Extract,
    /// Fetching records from the backend
    Fetch,
    /// Grouping fetched records
    Aggregate,
    /// Writing the output file
    Write,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Fetch => "fetch",
            Stage::Aggregate => "aggregate",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// Per-group record count reported in the run summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    /// Group key value
    pub group_key: String,
    /// Number of records in the group
    pub count: usize,
}

/// Summary returned by a completed pipeline run
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Data rows read from the input
    pub input_rows: usize,
    /// Input rows skipped because the key column was empty, absent or malformed
    pub dropped_rows: usize,
    /// Keys extracted from the input, duplicates included
    pub input_keys: usize,
    /// Keys removed as duplicates before fetching
    pub duplicate_keys: usize,
    /// Distinct keys submitted to the backend
    pub unique_keys: usize,
    /// Keys that resolved to a record
    pub resolved: usize,
    /// Keys the backend holds no record for
    pub missing: usize,
    /// Keys unresolved after retries were exhausted
    pub unresolved: usize,
    /// The unresolved keys themselves, for a targeted re-run
    pub unresolved_keys: Vec<LookupKey>,
    /// Number of groups produced
    pub groups: usize,
    /// Records skipped by grouping because they lack the group field
    pub ungrouped: usize,
    /// Record count per group, in group order
    pub group_counts: Vec<GroupCount>,
    /// Data rows written to the output file
    pub rows_written: usize,
    /// Location of the output file
    pub output_path: PathBuf,
    /// Location of the per-group summary file, when one was written
    pub group_summary_path: Option<PathBuf>,
    /// Whether the fetch stopped early because its time budget expired
    pub timed_out: bool,
    /// Wall-clock duration of the run in milliseconds
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Whether every extracted key was either resolved or confirmed missing
    pub fn is_complete(&self) -> bool {
        self.unresolved == 0
    }
}
