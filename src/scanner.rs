//! Full-table scan following continuation tokens

use std::time::Duration;

use crate::backend::{ContinuationToken, RecordStore, ScanRequest};
use crate::config::RetryConfig;
use crate::error::BackendError;
use crate::retry::with_retry;
use crate::types::Record;

/// Records collected by [`scan_all`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanOutcome {
    /// Every record of the table, in scan order
    pub records: Vec<Record>,
    /// Pages read
    pub pages: usize,
}

/// Read every page of `table`
///
/// Each page request is retried on throttling under `retry`; any other error
/// ends the scan. `page_delay` is slept between successive pages.
pub async fn scan_all(
    store: &dyn RecordStore,
    table: &str,
    page_size: usize,
    retry: &RetryConfig,
    page_delay: Duration,
) -> Result<ScanOutcome, BackendError> {
    let mut outcome = ScanOutcome::default();
    let mut continuation: Option<ContinuationToken> = None;

    loop {
        if outcome.pages > 0 && !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }

        let page = with_retry(retry, || {
            store.scan(
                table,
                ScanRequest {
                    page_size,
                    continuation: continuation.clone(),
                },
            )
        })
        .await?;

        outcome.pages += 1;
        tracing::debug!(
            table,
            page = outcome.pages,
            records = page.records.len(),
            "Scanned page"
        );
        outcome.records.extend(page.records);

        match page.next {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    tracing::info!(
        table,
        pages = outcome.pages,
        records = outcome.records.len(),
        "Table scan complete"
    );
    Ok(outcome)
}
