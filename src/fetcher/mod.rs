//! Batched record fetching with retry
//!
//! [`BatchFetcher`] turns an arbitrary key set into a sequence of backend-legal
//! batch-get requests and reassembles the answers into one [`FetchResult`].
//!
//! ## Per-batch resolution
//!
//! Each batch owns one attempt counter bounded by `retry.max_attempts`. Both
//! throttled calls and calls that leave keys unprocessed consume an attempt;
//! only the still-pending keys are re-requested. When the counter runs out the
//! pending keys are reported unresolved and the fetch moves on. Any backend
//! error other than throttling aborts the whole fetch with a [`FetchError`].
//!
//! ## Ordering and concurrency
//!
//! Successive batches are separated by `fetch.inter_batch_delay`. With
//! `fetch.concurrency > 1` several batches may be in flight, every call passing
//! through one shared [`RequestLimiter`]; results are still returned in key
//! extraction order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::RecordStore;
use crate::config::{FetchConfig, RetryConfig};
use crate::error::{BackendError, Error, FetchError, Result};
use crate::extract::dedupe_keys;
use crate::rate_limiter::RequestLimiter;
use crate::types::{Batch, FetchResult, LookupKey, Record};

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

/// Split `keys` into consecutive batches of at most `batch_size` keys
///
/// Batches cover every key exactly once, in order; only the last may be short.
pub fn partition(keys: &[LookupKey], batch_size: usize) -> Vec<Batch> {
    keys.chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            keys: chunk.to_vec(),
        })
        .collect()
}

/// Resolves key sets against a [`RecordStore`] in bounded batches
pub struct BatchFetcher {
    store: Arc<dyn RecordStore>,
    table: String,
    fetch: FetchConfig,
    retry: RetryConfig,
    limiter: RequestLimiter,
}

/// Result of resolving one batch
#[derive(Debug, Default)]
struct BatchOutcome {
    records: Vec<Record>,
    unresolved: Vec<LookupKey>,
    missing: Vec<LookupKey>,
    calls: usize,
    timed_out: bool,
}

/// A batch that hit a permanent backend error
#[derive(Debug)]
struct BatchFailure {
    index: usize,
    error: BackendError,
    calls: usize,
}

impl BatchFetcher {
    /// Create a fetcher for `table`
    ///
    /// Fails if the batch size is zero or above the store's per-request limit,
    /// or if concurrency is zero.
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: impl Into<String>,
        fetch: FetchConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let limit = store.max_batch_size();
        if fetch.batch_size == 0 || fetch.batch_size > limit {
            return Err(Error::Config {
                message: format!(
                    "batch size {} is outside the backend limit of 1..={}",
                    fetch.batch_size, limit
                ),
                key: Some("fetch.batch_size".to_string()),
            });
        }
        if fetch.concurrency == 0 {
            return Err(Error::Config {
                message: "concurrency must be at least 1".to_string(),
                key: Some("fetch.concurrency".to_string()),
            });
        }

        let limiter = RequestLimiter::new(fetch.max_requests_per_sec.map(u64::from));

        Ok(Self {
            store,
            table: table.into(),
            fetch,
            retry,
            limiter,
        })
    }

    /// Table every request addresses
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fetch the records for `keys`
    ///
    /// Duplicate keys are requested once. On success the returned records,
    /// unresolved keys and missing keys each follow the order in which the keys
    /// were first supplied.
    pub async fn fetch(&self, keys: &[LookupKey]) -> std::result::Result<FetchResult, FetchError> {
        let (unique, duplicates) = dedupe_keys(keys.iter().cloned());
        if duplicates > 0 {
            tracing::debug!(duplicates, "Ignoring duplicate keys");
        }

        let position: HashMap<LookupKey, usize> = unique
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), i))
            .collect();
        let batches = partition(&unique, self.fetch.batch_size);
        let batch_count = batches.len();
        let deadline = self.fetch.timeout.map(|t| Instant::now() + t);
        let pacing: Mutex<Option<Instant>> = Mutex::new(None);

        tracing::info!(
            table = %self.table,
            keys = unique.len(),
            batches = batch_count,
            concurrency = self.fetch.concurrency,
            "Starting batched fetch"
        );

        let mut outcomes = stream::iter(
            batches
                .into_iter()
                .map(|batch| self.resolve_batch(batch, deadline, &pacing)),
        )
        .buffered(self.fetch.concurrency);

        let mut result = FetchResult {
            batches: batch_count,
            ..FetchResult::default()
        };

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(outcome) => {
                    result.records.extend(outcome.records);
                    result.unresolved.extend(outcome.unresolved);
                    result.missing.extend(outcome.missing);
                    result.backend_calls += outcome.calls;
                    result.timed_out |= outcome.timed_out;
                }
                Err(failure) => {
                    // Dropping the stream cancels batches still in flight
                    drop(outcomes);
                    result.backend_calls += failure.calls;
                    sort_by_position(&mut result, &position);
                    tracing::error!(
                        batch = failure.index,
                        error = %failure.error,
                        resolved = result.records.len(),
                        "Fetch aborted by non-retryable backend error"
                    );
                    return Err(FetchError {
                        batch_index: failure.index,
                        source: failure.error,
                        completed: result,
                    });
                }
            }
        }

        sort_by_position(&mut result, &position);

        if result.timed_out {
            tracing::warn!(
                unresolved = result.unresolved.len(),
                "Fetch time budget expired"
            );
        }
        tracing::info!(
            resolved = result.records.len(),
            missing = result.missing.len(),
            unresolved = result.unresolved.len(),
            backend_calls = result.backend_calls,
            "Batched fetch complete"
        );

        Ok(result)
    }

    /// Wait until this batch may start
    ///
    /// `pacing` holds the last mark: the previous batch's completion when
    /// batches run one at a time, the previous batch's start otherwise.
    async fn pace(
        &self,
        index: usize,
        pacing: &Mutex<Option<Instant>>,
        deadline: Option<Instant>,
    ) {
        let mut last = pacing.lock().await;
        if index > 0 && !self.fetch.inter_batch_delay.is_zero() {
            if let Some(previous) = *last {
                let mut ready_at = previous + self.fetch.inter_batch_delay;
                if let Some(deadline) = deadline {
                    ready_at = ready_at.min(deadline);
                }
                tokio::time::sleep_until(ready_at).await;
            }
        }
        if self.fetch.concurrency > 1 {
            *last = Some(Instant::now());
        }
    }

    async fn resolve_batch(
        &self,
        batch: Batch,
        deadline: Option<Instant>,
        pacing: &Mutex<Option<Instant>>,
    ) -> std::result::Result<BatchOutcome, BatchFailure> {
        self.pace(batch.index, pacing, deadline).await;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut outcome = BatchOutcome::default();
        let mut pending = batch.keys;
        let mut attempt: u32 = 0;

        while !pending.is_empty() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                expire(batch.index, &mut pending, &mut outcome);
                break;
            }

            attempt += 1;
            if within(deadline, self.limiter.acquire(1)).await.is_none() {
                expire(batch.index, &mut pending, &mut outcome);
                break;
            }
            outcome.calls += 1;

            tracing::debug!(
                batch = batch.index,
                attempt,
                keys = pending.len(),
                "Issuing batch get"
            );

            let Some(reply) = within(deadline, self.store.batch_get(&self.table, &pending)).await
            else {
                expire(batch.index, &mut pending, &mut outcome);
                break;
            };

            match reply {
                Ok(response) => {
                    pending = merge_response(
                        batch.index,
                        pending,
                        response.records,
                        response.unprocessed,
                        &mut outcome,
                    );
                    if pending.is_empty() {
                        break;
                    }
                    if attempt >= max_attempts {
                        tracing::warn!(
                            batch = batch.index,
                            attempts = attempt,
                            unresolved = pending.len(),
                            "Unprocessed keys remain after all attempts"
                        );
                        outcome.unresolved.append(&mut pending);
                        break;
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::info!(
                        batch = batch.index,
                        attempt,
                        unprocessed = pending.len(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying unprocessed keys"
                    );
                    sleep_within(delay, deadline).await;
                }
                Err(e) if e.is_throttled() => {
                    if attempt >= max_attempts {
                        tracing::warn!(
                            batch = batch.index,
                            attempts = attempt,
                            error = %e,
                            unresolved = pending.len(),
                            "Batch still throttled after all attempts"
                        );
                        outcome.unresolved.append(&mut pending);
                        break;
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::warn!(
                        batch = batch.index,
                        attempt,
                        max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Batch throttled, backing off"
                    );
                    sleep_within(delay, deadline).await;
                }
                Err(error) => {
                    return Err(BatchFailure {
                        index: batch.index,
                        error,
                        calls: outcome.calls,
                    });
                }
            }
        }

        if self.fetch.concurrency == 1 {
            *pacing.lock().await = Some(Instant::now());
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for BatchFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFetcher")
            .field("table", &self.table)
            .field("fetch", &self.fetch)
            .field("retry", &self.retry)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

/// Fold one batch-get response into `outcome`, returning the keys still pending
///
/// Pending keys the backend neither returned nor reported unprocessed are
/// missing. Records for keys that were not requested are ignored.
fn merge_response(
    batch: usize,
    pending: Vec<LookupKey>,
    records: Vec<Record>,
    unprocessed: Vec<LookupKey>,
    outcome: &mut BatchOutcome,
) -> Vec<LookupKey> {
    let requested: HashSet<&LookupKey> = pending.iter().collect();
    let unprocessed: HashSet<LookupKey> = unprocessed
        .into_iter()
        .filter(|key| requested.contains(key))
        .collect();

    let mut returned: HashSet<LookupKey> = HashSet::with_capacity(records.len());
    for record in records {
        if !requested.contains(&record.key) || unprocessed.contains(&record.key) {
            tracing::debug!(batch, key = %record.key, "Ignoring record for a key not requested");
            continue;
        }
        if returned.insert(record.key.clone()) {
            outcome.records.push(record);
        }
    }

    let mut still_pending = Vec::with_capacity(unprocessed.len());
    for key in pending {
        if returned.contains(&key) {
            continue;
        }
        if unprocessed.contains(&key) {
            still_pending.push(key);
        } else {
            outcome.missing.push(key);
        }
    }
    still_pending
}

/// Run `fut` to completion, or give up at `deadline` and return `None`
async fn within<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Report every pending key of a batch unresolved because the time budget ran out
fn expire(batch: usize, pending: &mut Vec<LookupKey>, outcome: &mut BatchOutcome) {
    tracing::warn!(
        batch,
        pending = pending.len(),
        "Time budget expired before batch resolved"
    );
    outcome.unresolved.append(pending);
    outcome.timed_out = true;
}

/// Sleep for `delay`, waking early at `deadline`
async fn sleep_within(delay: std::time::Duration, deadline: Option<Instant>) {
    let wake = Instant::now() + delay;
    let wake = match deadline {
        Some(deadline) => wake.min(deadline),
        None => wake,
    };
    tokio::time::sleep_until(wake).await;
}

fn sort_by_position(result: &mut FetchResult, position: &HashMap<LookupKey, usize>) {
    let rank = |key: &LookupKey| position.get(key).copied().unwrap_or(usize::MAX);
    result.records.sort_by_key(|record| rank(&record.key));
    result.unresolved.sort_by_key(|key| rank(key));
    result.missing.sort_by_key(|key| rank(key));
}
