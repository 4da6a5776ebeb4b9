//! In-process record store.

use std::collections::HashMap;

use indexmap::IndexMap;
use tokio::sync::RwLock;

use super::{
    BatchGetOutput, ContinuationToken, DEFAULT_MAX_BATCH_SIZE, RecordStore, ScanPage, ScanRequest,
    check_batch_request,
};
use crate::error::BackendError;
use crate::types::{LookupKey, Record};

/// Record store holding every table in memory
///
/// Tables keep insertion order, which is also their scan order. The store never
/// throttles and never reports unprocessed keys.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, IndexMap<LookupKey, Record>>>,
    max_batch_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default batch limit
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Override the per-request key limit
    #[must_use]
    pub fn with_max_batch_size(mut self, limit: usize) -> Self {
        self.max_batch_size = limit.max(1);
        self
    }

    /// Create `table` if it does not exist yet
    pub async fn create_table(&self, table: &str) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
    }

    /// Insert or replace records, creating the table on first use
    pub async fn put_records(&self, table: &str, records: impl IntoIterator<Item = Record>) {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        for record in records {
            rows.insert(record.key.clone(), record);
        }
    }

    /// Number of records in `table` (0 if it does not exist)
    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, IndexMap::len)
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: &[LookupKey],
    ) -> Result<BatchGetOutput, BackendError> {
        check_batch_request(keys, self.max_batch_size)?;

        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| BackendError::TableNotFound(table.to_string()))?;

        let records = keys
            .iter()
            .filter_map(|key| rows.get(key).cloned())
            .collect();

        Ok(BatchGetOutput {
            records,
            unprocessed: Vec::new(),
        })
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> Result<ScanPage, BackendError> {
        if request.page_size == 0 {
            return Err(BackendError::InvalidRequest(
                "page size must be at least 1".to_string(),
            ));
        }

        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| BackendError::TableNotFound(table.to_string()))?;

        // Token is the insertion offset of the first record on the next page
        let start = match &request.continuation {
            None => 0,
            Some(token) => token.0.parse::<usize>().map_err(|_| {
                BackendError::InvalidRequest(format!("malformed continuation token: {token}"))
            })?,
        };

        let end = start.saturating_add(request.page_size).min(rows.len());
        let records = rows
            .values()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect();
        let next = (end < rows.len()).then(|| ContinuationToken(end.to_string()));

        Ok(ScanPage { records, next })
    }
}
