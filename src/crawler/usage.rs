//! Request accounting shared by crawl executors
//!
//! Executors add to an explicit counter that is handed to them; the
//! scheduler flushes it to storage after each job.

use crate::storage::{self, SharedStorage, Storage};
use crate::StrataError;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Service name used for plain HTTP crawl traffic
pub const HTTP_CRAWL_SERVICE: &str = "http-crawl";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub bytes: u64,
}

/// Per-service request and byte counters
#[derive(Debug, Clone, Default)]
pub struct UsageCounter {
    inner: Arc<Mutex<BTreeMap<String, UsageTotals>>>,
}

impl UsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request and the bytes it downloaded
    pub fn record(&self, service: &str, bytes: u64) {
        // A poisoned counter only loses accounting
        if let Ok(mut counters) = self.inner.lock() {
            let entry = counters.entry(service.to_string()).or_default();
            entry.requests += 1;
            entry.bytes += bytes;
        }
    }

    pub fn totals(&self, service: &str) -> UsageTotals {
        self.inner
            .lock()
            .ok()
            .and_then(|counters| counters.get(service).copied())
            .unwrap_or_default()
    }

    /// Takes the accumulated counts, leaving the counter empty
    pub fn drain(&self) -> BTreeMap<String, UsageTotals> {
        self.inner
            .lock()
            .map(|mut counters| std::mem::take(&mut *counters))
            .unwrap_or_default()
    }

    /// Adds the accumulated counts to today's usage rows
    ///
    /// Counts are only removed from the counter once they are written.
    pub fn flush(&self, storage: &SharedStorage) -> Result<(), StrataError> {
        let drained = self.drain();
        if drained.is_empty() {
            return Ok(());
        }

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let mut db = storage::lock(storage)?;
        let mut pending = drained.into_iter();
        while let Some((service, totals)) = pending.next() {
            if let Err(e) = db.record_usage(&service, &day, totals.requests, totals.bytes) {
                self.restore(std::iter::once((service, totals)).chain(pending));
                return Err(e.into());
            }
            debug!(
                "Recorded {} requests ({} bytes) for {}",
                totals.requests, totals.bytes, service
            );
        }
        Ok(())
    }

    fn restore(&self, unwritten: impl Iterator<Item = (String, UsageTotals)>) {
        if let Ok(mut counters) = self.inner.lock() {
            for (service, totals) in unwritten {
                let entry = counters.entry(service).or_default();
                entry.requests += totals.requests;
                entry.bytes += totals.bytes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_record_and_totals() {
        let counter = UsageCounter::new();
        counter.record(HTTP_CRAWL_SERVICE, 100);
        counter.record(HTTP_CRAWL_SERVICE, 50);
        counter.record("other", 1);

        assert_eq!(
            counter.totals(HTTP_CRAWL_SERVICE),
            UsageTotals {
                requests: 2,
                bytes: 150
            }
        );
        assert_eq!(counter.totals("missing"), UsageTotals::default());
    }

    #[test]
    fn test_clones_share_counts() {
        let counter = UsageCounter::new();
        let clone = counter.clone();
        clone.record(HTTP_CRAWL_SERVICE, 10);
        assert_eq!(counter.totals(HTTP_CRAWL_SERVICE).requests, 1);
    }

    #[test]
    fn test_flush_writes_and_empties() {
        let storage: SharedStorage =
            Arc::new(StdMutex::new(SqliteStorage::new_in_memory().unwrap()));
        let counter = UsageCounter::new();
        counter.record(HTTP_CRAWL_SERVICE, 10);
        counter.record(HTTP_CRAWL_SERVICE, 20);

        counter.flush(&storage).unwrap();
        counter.record(HTTP_CRAWL_SERVICE, 5);
        counter.flush(&storage).unwrap();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let usage = storage::lock(&storage).unwrap().usage_for_day(&day).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].request_count, 3);
        assert_eq!(usage[0].bytes, 35);
        assert!(counter.drain().is_empty());
    }
}
