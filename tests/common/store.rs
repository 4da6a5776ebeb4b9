//! Scripted record store double

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use keyset_export::{
    BackendError, BatchGetOutput, LookupKey, MemoryStore, Record, RecordStore, ScanPage,
    ScanRequest,
};

/// Decides the outcome of one batch-get call from its index and keys
pub type Script = Box<dyn Fn(usize, &[LookupKey]) -> Option<BackendError> + Send + Sync>;

/// Wraps a [`MemoryStore`], failing the calls its script picks
///
/// The script returns `Some(error)` to fail a call and `None` to serve it.
/// Every call is recorded.
pub struct ScriptedStore {
    inner: MemoryStore,
    script: Script,
    calls: Mutex<Vec<Vec<LookupKey>>>,
    unprocessed_on: HashMap<usize, usize>,
}

impl ScriptedStore {
    pub fn new(
        inner: MemoryStore,
        script: impl Fn(usize, &[LookupKey]) -> Option<BackendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            unprocessed_on: HashMap::new(),
        }
    }

    /// Report the last `n` keys of call `call` as unprocessed
    pub fn unprocessed_on(mut self, call: usize, n: usize) -> Self {
        self.unprocessed_on.insert(call, n);
        self
    }

    pub fn calls(&self) -> Vec<Vec<LookupKey>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: &[LookupKey],
    ) -> Result<BatchGetOutput, BackendError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(keys.to_vec());
            calls.len() - 1
        };
        if let Some(error) = (self.script)(index, keys) {
            return Err(error);
        }

        let split = keys
            .len()
            .saturating_sub(self.unprocessed_on.get(&index).copied().unwrap_or(0));
        let mut output = if split == 0 {
            BatchGetOutput::default()
        } else {
            self.inner.batch_get(table, &keys[..split]).await?
        };
        output.unprocessed = keys[split..].to_vec();
        Ok(output)
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> Result<ScanPage, BackendError> {
        self.inner.scan(table, request).await
    }
}

/// Memory store holding `records` in `table`
pub async fn memory_store(table: &str, records: Vec<Record>) -> MemoryStore {
    let store = MemoryStore::new();
    store.put_records(table, records).await;
    store
}
