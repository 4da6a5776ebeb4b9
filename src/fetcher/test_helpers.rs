//! Shared test doubles for fetcher and pipeline unit tests.

use crate::backend::{BatchGetOutput, RecordStore, ScanPage, ScanRequest};
use crate::config::{FetchConfig, RetryConfig};
use crate::error::BackendError;
use crate::types::{Fields, LookupKey, Record};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// How the scripted store answers one call
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    /// Return every stored record among the requested keys
    Serve,
    /// Fail with a throttling error
    Throttle,
    /// Fail with the given error
    Fail(BackendError),
    /// Report the last `n` requested keys as unprocessed, serve the rest
    Unprocessed(usize),
}

type Rule = Box<dyn Fn(usize, &[LookupKey]) -> Reply + Send + Sync>;

/// Record store whose answers are decided per call by a rule closure
///
/// The rule receives the zero-based call index and the requested keys.
pub(crate) struct ScriptedStore {
    records: HashMap<LookupKey, Record>,
    rule: Rule,
    calls: Mutex<Vec<Vec<LookupKey>>>,
    latency: Duration,
}

impl ScriptedStore {
    pub(crate) fn new(
        records: impl IntoIterator<Item = Record>,
        rule: impl Fn(usize, &[LookupKey]) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
            rule: Box::new(rule),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Store that serves every call
    pub(crate) fn serving(records: impl IntoIterator<Item = Record>) -> Self {
        Self::new(records, |_, _| Reply::Serve)
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Keys of every call, in call order
    pub(crate) fn calls(&self) -> Vec<Vec<LookupKey>> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn serve(&self, keys: &[LookupKey]) -> Vec<Record> {
        keys.iter()
            .filter_map(|k| self.records.get(k).cloned())
            .collect()
    }
}

#[async_trait::async_trait]
impl RecordStore for ScriptedStore {
    async fn batch_get(
        &self,
        _table: &str,
        keys: &[LookupKey],
    ) -> Result<BatchGetOutput, BackendError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(keys.to_vec());
            calls.len() - 1
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match (self.rule)(index, keys) {
            Reply::Serve => Ok(BatchGetOutput {
                records: self.serve(keys),
                unprocessed: Vec::new(),
            }),
            Reply::Throttle => Err(BackendError::Throttled(format!("call {index} throttled"))),
            Reply::Fail(e) => Err(e),
            Reply::Unprocessed(n) => {
                let split = keys.len().saturating_sub(n);
                Ok(BatchGetOutput {
                    records: self.serve(&keys[..split]),
                    unprocessed: keys[split..].to_vec(),
                })
            }
        }
    }

    async fn scan(&self, _table: &str, _request: ScanRequest) -> Result<ScanPage, BackendError> {
        let mut records: Vec<Record> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ScanPage {
            records,
            next: None,
        })
    }
}

pub(crate) fn key(raw: &str) -> LookupKey {
    LookupKey::parse(raw).unwrap()
}

/// Keys `k00`, `k01`, ... in order
pub(crate) fn keys(n: usize) -> Vec<LookupKey> {
    (0..n).map(|i| key(&format!("k{i:02}"))).collect()
}

pub(crate) fn record(key_str: &str, owner: &str) -> Record {
    let mut fields = Fields::new();
    fields.insert("id".into(), serde_json::json!(key_str));
    fields.insert("owner".into(), serde_json::json!(owner));
    Record::new(key(key_str), fields)
}

/// One record per key, owners cycling through `owners`
pub(crate) fn records_for(keys: &[LookupKey], owners: &[&str]) -> Vec<Record> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| record(k.as_str(), owners[i % owners.len()]))
        .collect()
}

pub(crate) fn fast_fetch(batch_size: usize) -> FetchConfig {
    FetchConfig {
        batch_size,
        inter_batch_delay: Duration::ZERO,
        ..FetchConfig::default()
    }
}

pub(crate) fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(20),
        jitter_max: Duration::ZERO,
    }
}
