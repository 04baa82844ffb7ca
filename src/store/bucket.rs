//! Counter store with one-second buckets.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{first_open_step, retention_cutoff, CounterStore, StoreError};
use crate::ratelimit::SEARCH_STEP_SECS;

/// A counter store that groups admissions into unix-second buckets.
///
/// Memory grows with the number of distinct seconds rather than the number
/// of admissions. A query counts every bucket whose second lies between the
/// seconds of `start` and `end` inclusive, so a window can over-count by up
/// to one second's worth of admissions at each edge.
#[derive(Debug, Default)]
pub struct BucketStore {
    /// Unix second -> admissions recorded during that second
    buckets: DashMap<i64, u64>,
    /// How long buckets are kept, if pruning is enabled
    retention: Option<Duration>,
}

impl BucketStore {
    /// Create a store that keeps every bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that drops buckets older than `retention`.
    pub fn with_retention(retention: std::time::Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            retention: Duration::from_std(retention).ok(),
        }
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn prune(&self, retention: Duration) {
        let cutoff = retention_cutoff(retention).timestamp();
        let before = self.buckets.len();
        self.buckets.retain(|second, _| *second >= cutoff);
        let pruned = before.saturating_sub(self.buckets.len());
        if pruned > 0 {
            trace!(pruned, cutoff, "Pruned expired buckets");
        }
    }
}

#[async_trait]
impl CounterStore for BucketStore {
    async fn count_in_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let (first, last) = (start.timestamp(), end.timestamp());
        if first > last {
            return Ok(0);
        }

        // Look up each second of a short window, scan the live buckets otherwise.
        let seconds = last.abs_diff(first).saturating_add(1);
        let count = if seconds <= self.buckets.len() as u64 {
            (first..=last)
                .filter_map(|second| self.buckets.get(&second).map(|n| *n))
                .sum()
        } else {
            self.buckets
                .iter()
                .filter(|bucket| (first..=last).contains(bucket.key()))
                .map(|bucket| *bucket.value())
                .sum()
        };
        Ok(count)
    }

    async fn increment(&self, instant: DateTime<Utc>) -> Result<(), StoreError> {
        *self.buckets.entry(instant.timestamp()).or_insert(0) += 1;

        if let Some(retention) = self.retention {
            self.prune(retention);
        }
        Ok(())
    }

    /// Same instant as the default search. The window start moves whole
    /// seconds per step, so the search jumps from one bucket leaving to the next.
    async fn find_next_opening(
        &self,
        from: DateTime<Utc>,
        interval: Duration,
        quota: u64,
    ) -> Result<DateTime<Utc>, StoreError> {
        let lo = (from - interval).timestamp();
        let hi = from.timestamp();

        let mut snapshot: Vec<(i64, u64)> = self
            .buckets
            .iter()
            .filter(|bucket| *bucket.key() >= lo)
            .map(|bucket| (*bucket.key(), *bucket.value()))
            .collect();
        snapshot.sort_unstable();

        let steps = first_open_step(&snapshot, lo, hi, SEARCH_STEP_SECS, quota)
            .ok_or_else(|| StoreError::Backend("a zero quota never opens".to_string()))?;
        trace!(steps, buckets = snapshot.len(), "Computed next opening");
        Ok(from + Duration::seconds(steps * SEARCH_STEP_SECS))
    }
}
