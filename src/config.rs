//! Configuration types for keyset-export

use crate::error::{Error, Result};
use crate::types::WriteMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backend addressing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base table (collection) name (default: "records")
    #[serde(default = "default_table")]
    pub table: String,

    /// Deployment stage appended to the table name as `{table}-{stage}` (default: none)
    #[serde(default)]
    pub stage: Option<String>,

    /// SQLite file backing the reference store (default: "keyset-export.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            stage: None,
            database_path: default_database_path(),
        }
    }
}

impl BackendConfig {
    /// Fully qualified table name, including the stage suffix when configured
    pub fn qualified_table(&self) -> String {
        match self.stage.as_deref().map(str::trim) {
            Some(stage) if !stage.is_empty() => format!("{}-{}", self.table, stage),
            _ => self.table.clone(),
        }
    }
}

/// Batched fetch behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Keys per batch-get request, at most the backend's hard limit (default: 25)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between successive batches, independent of backoff (default: 200 ms)
    #[serde(default = "default_inter_batch_delay", with = "duration_ms_serde")]
    pub inter_batch_delay: Duration,

    /// Batches allowed in flight at once (default: 1 = strictly sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cap on batch-get requests issued per second across all in-flight batches (None = uncapped)
    #[serde(default)]
    pub max_requests_per_sec: Option<u32>,

    /// Wall-clock budget for one fetch; keys not resolved in time are reported unresolved
    #[serde(default, with = "optional_duration_ms_serde")]
    pub timeout: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_batch_delay: default_inter_batch_delay(),
            concurrency: default_concurrency(),
            max_requests_per_sec: None,
            timeout: None,
        }
    }
}

/// Retry policy for throttled or partially processed batches
///
/// The delay before retry `n` (counted from zero) is
/// `min(base_delay * 2^n, max_delay)` plus a uniform jitter in `[0, jitter_max)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per batch, the first one included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_base_delay", with = "duration_ms_serde")]
    pub base_delay: Duration,

    /// Upper bound on the exponential part of the delay (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Exclusive upper bound of the random jitter added to each delay (default: 100 ms)
    #[serde(default = "default_jitter_max", with = "duration_ms_serde")]
    pub jitter_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter_max: default_jitter_max(),
        }
    }
}

/// Input parsing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputConfig {
    /// Header name of the column holding lookup keys (default: "id")
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Field delimiter (default: ',')
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            key_column: default_key_column(),
            delimiter: default_delimiter(),
        }
    }
}

/// Row layout of the output file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// One row per resolved record, in key extraction order (default)
    #[default]
    Flat,
    /// Rows grouped by `group_field`, groups in first-occurrence order
    Grouped,
}

/// Output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Explicit output file; when unset a dated file is created in `output_dir`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Directory for dated output files (default: "exports")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// File name prefix for dated output files (default: "fetched_records")
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Output columns in order; empty means every field seen, in first-seen order
    #[serde(default)]
    pub columns: Vec<String>,

    /// Create (header + rows) or append (rows only)
    #[serde(default)]
    pub mode: WriteMode,

    /// Flat or grouped row order
    #[serde(default)]
    pub layout: OutputLayout,

    /// Record field used to group records (None = no grouping)
    #[serde(default)]
    pub group_field: Option<String>,

    /// Also write a `group_key,count` file next to the output (default: false)
    #[serde(default)]
    pub group_summary: bool,

    /// Field delimiter (default: ',')
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            columns: Vec::new(),
            mode: WriteMode::default(),
            layout: OutputLayout::default(),
            group_field: None,
            group_summary: false,
            delimiter: default_delimiter(),
        }
    }
}

/// Main configuration for an export run
///
/// Every section has defaults, so an empty JSON object is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend addressing
    #[serde(default)]
    pub backend: BackendConfig,

    /// Batched fetch behavior
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Input parsing
    #[serde(default)]
    pub input: InputConfig,

    /// Output location and layout
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Parse a configuration from JSON and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.backend.table.trim().is_empty() {
            return Err(config_error("table name must not be empty", "backend.table"));
        }
        if self.fetch.batch_size == 0 {
            return Err(config_error(
                "batch size must be at least 1",
                "fetch.batch_size",
            ));
        }
        if self.fetch.concurrency == 0 {
            return Err(config_error(
                "concurrency must be at least 1",
                "fetch.concurrency",
            ));
        }
        if self.fetch.max_requests_per_sec == Some(0) {
            return Err(config_error(
                "request rate cap must be positive; omit it to disable",
                "fetch.max_requests_per_sec",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error(
                "max_attempts counts the first attempt and must be at least 1",
                "retry.max_attempts",
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(config_error(
                "base_delay must not exceed max_delay",
                "retry.base_delay",
            ));
        }
        if self.input.key_column.trim().is_empty() {
            return Err(config_error(
                "key column must not be empty",
                "input.key_column",
            ));
        }
        check_delimiter(self.input.delimiter, "input.delimiter")?;
        check_delimiter(self.output.delimiter, "output.delimiter")?;
        if self.output.layout == OutputLayout::Grouped && self.output.group_field.is_none() {
            return Err(config_error(
                "grouped layout requires a group field",
                "output.group_field",
            ));
        }
        if self.output.group_summary && self.output.group_field.is_none() {
            return Err(config_error(
                "group summary requires a group field",
                "output.group_field",
            ));
        }
        Ok(())
    }

    /// Input delimiter as a byte
    pub(crate) fn input_delimiter(&self) -> u8 {
        delimiter_byte(self.input.delimiter)
    }

    /// Output delimiter as a byte
    pub(crate) fn output_delimiter(&self) -> u8 {
        delimiter_byte(self.output.delimiter)
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn check_delimiter(delimiter: char, key: &str) -> Result<()> {
    if !delimiter.is_ascii() || matches!(delimiter, '"' | '\n' | '\r') {
        return Err(config_error(
            "delimiter must be a single ASCII character other than a quote or newline",
            key,
        ));
    }
    Ok(())
}

// Only called on validated configs, where the delimiter is ASCII
fn delimiter_byte(delimiter: char) -> u8 {
    u8::try_from(delimiter).unwrap_or(b',')
}

fn default_table() -> String {
    "records".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("keyset-export.db")
}

fn default_batch_size() -> usize {
    25
}

fn default_inter_batch_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter_max() -> Duration {
    Duration::from_millis(100)
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_file_prefix() -> String {
    "fetched_records".to_string()
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper (milliseconds)
mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
