//! # keyset-export
//!
//! Resilient batched key lookup and aggregation for partitioned key-value stores.
//!
//! Given a CSV of record identifiers, keyset-export fetches the matching
//! records in backend-legal batches, retries throttled and partially processed
//! requests with exponential backoff, groups the results by a secondary field
//! and writes them to a CSV file.
//!
//! ## Design Philosophy
//!
//! - **Partial success is success** - keys that stay throttled are reported, not fatal
//! - **Sensible defaults** - an empty configuration runs against the reference store
//! - **Library-first** - no CLI, the backend is injected as a [`RecordStore`] handle
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use keyset_export::{Config, ExportPipeline, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.backend.table = "Conversations".to_string();
//!     config.backend.stage = Some("prod".to_string());
//!     config.input.key_column = "conversation_id".to_string();
//!     config.output.group_field = Some("user_id".to_string());
//!
//!     let store = SqliteStore::new(&config.backend.database_path).await?;
//!     let pipeline = ExportPipeline::new(config, Arc::new(store))?;
//!
//!     let summary = pipeline.run(Path::new("conversation_ids.csv")).await?;
//!     println!(
//!         "{} resolved, {} unresolved, written to {}",
//!         summary.resolved,
//!         summary.unresolved,
//!         summary.output_path.display()
//!     );
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Grouping of fetched records
pub mod aggregate;
/// Record store abstraction and reference stores
pub mod backend;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Lookup key extraction
pub mod extract;
/// Batched record fetching with retry
pub mod fetcher;
/// Merging of CSV exports
pub mod merge;
/// Export pipeline orchestration
pub mod pipeline;
/// Request rate limiting with token bucket
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Full-table scans
pub mod scanner;
/// Core types
pub mod types;
/// Streaming CSV output
pub mod writer;

// Re-export commonly used types
pub use aggregate::{Group, Groups, group_records};
pub use backend::{
    BatchGetOutput, ContinuationToken, MemoryStore, RecordStore, ScanPage, ScanRequest,
    SqliteStore,
};
pub use config::{
    BackendConfig, Config, FetchConfig, InputConfig, OutputConfig, OutputLayout, RetryConfig,
};
pub use error::{BackendError, DatabaseError, Error, FetchError, Result};
pub use extract::{ExtractedKeys, dedupe_keys, extract_keys, extract_keys_from_path};
pub use fetcher::{BatchFetcher, partition};
pub use merge::{MergeSummary, merge_exports};
pub use pipeline::ExportPipeline;
pub use retry::{IsRetryable, RetryPolicy, with_retry};
pub use scanner::{ScanOutcome, scan_all};
pub use types::{
    Batch, FetchResult, Fields, GroupCount, LookupKey, Record, RunSummary, Stage, WriteMode,
};
pub use writer::{OutputRow, TabularWriter, write_records};
