//! Record store abstraction
//!
//! The pipeline talks to its key-value backend only through [`RecordStore`],
//! which exposes the two capabilities every partitioned store offers: a
//! size-bounded batch get by key, and a paged scan driven by an opaque
//! continuation token.
//!
//! ## Implementations
//!
//! - [`memory`]: in-process store, handy for embedding and tests
//! - [`sqlite`]: SQLite-backed reference store for local runs

use crate::error::BackendError;
use crate::types::{LookupKey, Record};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Hard per-request key limit of the reference backends
pub const DEFAULT_MAX_BATCH_SIZE: usize = 25;

/// Response to one batch-get request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetOutput {
    /// Records found for the requested keys, in any order
    pub records: Vec<Record>,
    /// Requested keys the backend did not get to in this attempt
    ///
    /// These differ from keys without a record: they must be requested again.
    pub unprocessed: Vec<LookupKey>,
}

/// Opaque cursor marking where the next scan page begins
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scan page request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    /// Maximum records to return
    pub page_size: usize,
    /// Cursor from the previous page, None for the first page
    pub continuation: Option<ContinuationToken>,
}

/// One page of scan results
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    /// Records on this page
    pub records: Vec<Record>,
    /// Cursor for the next page, None when the scan is complete
    pub next: Option<ContinuationToken>,
}

/// Abstraction over a partitioned key-value backend.
///
/// Implementations must be safe to share between the futures of one fetch.
/// Throttling must be reported as [`BackendError::Throttled`]; every other
/// error kind aborts the calling operation.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Hard limit on keys per batch-get request
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// Fetch the records addressed by `keys` from `table`
    async fn batch_get(
        &self,
        table: &str,
        keys: &[LookupKey],
    ) -> Result<BatchGetOutput, BackendError>;

    /// Read one page of `table`
    async fn scan(&self, table: &str, request: ScanRequest) -> Result<ScanPage, BackendError>;
}

/// Reject requests a real backend would refuse outright
pub(crate) fn check_batch_request(keys: &[LookupKey], limit: usize) -> Result<(), BackendError> {
    if keys.is_empty() {
        return Err(BackendError::InvalidRequest(
            "batch get requires at least one key".to_string(),
        ));
    }
    if keys.len() > limit {
        return Err(BackendError::InvalidRequest(format!(
            "batch of {} keys exceeds the limit of {}",
            keys.len(),
            limit
        )));
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<LookupKey> {
        (0..n)
            .map(|i| LookupKey::parse(&format!("k{i}")).unwrap())
            .collect()
    }

    #[test]
    fn batch_request_limits() {
        assert!(check_batch_request(&keys(1), 25).is_ok());
        assert!(check_batch_request(&keys(25), 25).is_ok());
        assert!(matches!(
            check_batch_request(&keys(26), 25),
            Err(BackendError::InvalidRequest(_))
        ));
        assert!(matches!(
            check_batch_request(&[], 25),
            Err(BackendError::InvalidRequest(_))
        ));
    }
}
