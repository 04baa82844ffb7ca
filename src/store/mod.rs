//! Counter stores that record admissions for the gate.
//!
//! The gate only needs two operations from a store: count the admissions in
//! a closed time interval, and record one admission at an instant. How the
//! admissions are kept, and when old ones are reclaimed, is up to the store.

mod bucket;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::trace;

use crate::ratelimit::SlidingWindow;

pub use bucket::BucketStore;
pub use memory::MemoryStore;

/// Errors reported by a counter store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Admission counter consumed by the gate.
///
/// Implementations must be safe to call from many gates and tasks at once.
/// A successful `increment` must eventually be visible to later
/// `count_in_interval` calls covering its instant.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Number of admissions recorded with an instant in `[start, end]`.
    async fn count_in_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Record one admission at `instant`.
    async fn increment(&self, instant: DateTime<Utc>) -> Result<(), StoreError>;

    /// Earliest instant `from + k` seconds, for a whole `k >= 0`, whose
    /// trailing window of width `interval` holds fewer than `quota` admissions.
    ///
    /// The default walks the window forward one second at a time, issuing
    /// one count query per step. Stores that can answer more directly may
    /// override this, but must return the same instant.
    async fn find_next_opening(
        &self,
        from: DateTime<Utc>,
        interval: Duration,
        quota: u64,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut window = SlidingWindow::ending_at(from, interval);
        loop {
            let count = self.count_in_interval(window.start, window.end).await?;
            trace!(end = %window.end, count, quota, "Checked window for an opening");
            if count < quota {
                return Ok(window.end);
            }
            window = window.advance();
        }
    }
}

#[async_trait]
impl<T: CounterStore> CounterStore for Arc<T> {
    async fn count_in_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).count_in_interval(start, end).await
    }

    async fn increment(&self, instant: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).increment(instant).await
    }

    async fn find_next_opening(
        &self,
        from: DateTime<Utc>,
        interval: Duration,
        quota: u64,
    ) -> Result<DateTime<Utc>, StoreError> {
        (**self).find_next_opening(from, interval, quota).await
    }
}

/// Smallest whole `k >= 0` for which fewer than `quota` admissions have a
/// key in `[lo + k * step, hi + k * step]`.
///
/// `admissions` holds `(key, count)` pairs sorted by key. Between two steps
/// the count can only drop once an admission falls behind the window start,
/// so the search jumps straight to the step at which enough of the oldest
/// admissions have left, and the number of jumps is bounded by the number of
/// keys. Returns `None` for a zero quota, which never opens.
pub(crate) fn first_open_step(
    admissions: &[(i64, u64)],
    lo: i64,
    hi: i64,
    step: i64,
    quota: u64,
) -> Option<i64> {
    if quota == 0 {
        return None;
    }

    let mut totals = Vec::with_capacity(admissions.len() + 1);
    let mut running = 0u64;
    totals.push(running);
    for (_, n) in admissions {
        running = running.saturating_add(*n);
        totals.push(running);
    }

    let mut k = 0i64;
    loop {
        let first = admissions.partition_point(|(key, _)| *key < lo + k * step);
        let last = admissions.partition_point(|(key, _)| *key <= hi + k * step);
        let count = totals[last] - totals[first];
        if count < quota {
            return Some(k);
        }

        // The window reopens once `count - quota + 1` of its oldest
        // admissions are behind the start; the last of them sets the step.
        let needed = totals[first] + count - quota + 1;
        let leaving = totals.partition_point(|total| *total < needed);
        k = (admissions[leaving - 1].0 - lo).div_euclid(step) + 1;
    }
}

/// Cutoff before which admissions may be reclaimed.
pub(crate) fn retention_cutoff(retention: Duration) -> DateTime<Utc> {
    Utc::now() - retention
}
