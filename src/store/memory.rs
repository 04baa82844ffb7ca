//! In-memory counter store keyed by exact admission instants.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::trace;

use super::{first_open_step, retention_cutoff, CounterStore, StoreError};
use crate::ratelimit::SEARCH_STEP_SECS;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A counter store holding every admission instant in an ordered map.
///
/// Counts are exact over closed intervals. When a retention period is set,
/// admissions older than `now - retention` are dropped on each increment;
/// the retention must be at least as long as the widest window queried.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Admission instant -> number of admissions recorded at it
    admissions: Mutex<BTreeMap<DateTime<Utc>, u64>>,
    /// How long admissions are kept, if pruning is enabled
    retention: Option<Duration>,
}

impl MemoryStore {
    /// Create a store that keeps every admission.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that prunes admissions older than `retention`.
    pub fn with_retention(retention: std::time::Duration) -> Self {
        Self {
            admissions: Mutex::new(BTreeMap::new()),
            retention: Duration::from_std(retention).ok(),
        }
    }

    /// Total number of admissions currently held.
    pub fn len(&self) -> u64 {
        self.admissions.lock().values().sum()
    }

    /// Whether the store holds no admissions.
    pub fn is_empty(&self) -> bool {
        self.admissions.lock().is_empty()
    }

    /// Drop all admissions.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.admissions.lock().clear();
    }

    fn count_locked(
        admissions: &BTreeMap<DateTime<Utc>, u64>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> u64 {
        if start > end {
            return 0;
        }
        admissions.range(start..=end).map(|(_, n)| *n).sum()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn count_in_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let admissions = self.admissions.lock();
        Ok(Self::count_locked(&admissions, start, end))
    }

    async fn increment(&self, instant: DateTime<Utc>) -> Result<(), StoreError> {
        let mut admissions = self.admissions.lock();
        *admissions.entry(instant).or_insert(0) += 1;

        if let Some(retention) = self.retention {
            let cutoff = retention_cutoff(retention);
            if admissions.first_key_value().is_some_and(|(t, _)| *t < cutoff) {
                let kept = admissions.split_off(&cutoff);
                trace!(
                    pruned = admissions.len(),
                    kept = kept.len(),
                    "Pruned expired admissions"
                );
                *admissions = kept;
            }
        }
        Ok(())
    }

    /// Same instant as the default search, computed from a snapshot of the
    /// admissions at or after the first window start.
    async fn find_next_opening(
        &self,
        from: DateTime<Utc>,
        interval: Duration,
        quota: u64,
    ) -> Result<DateTime<Utc>, StoreError> {
        let lo = interval
            .num_nanoseconds()
            .map(|nanos| -nanos)
            .ok_or_else(|| StoreError::Backend(format!("interval out of range: {}", interval)))?;

        // Keys are nanoseconds relative to `from`.
        let snapshot: Vec<(i64, u64)> = {
            let admissions = self.admissions.lock();
            admissions
                .range(from - interval..)
                .filter_map(|(t, n)| (*t - from).num_nanoseconds().map(|key| (key, *n)))
                .collect()
        };

        let steps = first_open_step(&snapshot, lo, 0, SEARCH_STEP_SECS * NANOS_PER_SEC, quota)
            .ok_or_else(|| StoreError::Backend("a zero quota never opens".to_string()))?;
        trace!(steps, admissions = snapshot.len(), "Computed next opening");
        Ok(from + Duration::seconds(steps * SEARCH_STEP_SECS))
    }
}
