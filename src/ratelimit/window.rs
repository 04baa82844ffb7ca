//! Sliding window configuration and arithmetic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlidegateError};

/// Distance the next-opening search advances the window per step.
pub const SEARCH_STEP_SECS: i64 = 1;

/// Longest window the gate accepts (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// What the gate does when the window is saturated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Fail the call with a rate limit error
    #[default]
    RejectImmediately,
    /// Block until the window has room again
    WaitForOpening,
}

/// Admission settings for a gate.
///
/// The gate keeps one of these behind a lock and copies it out once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Width of the sliding window in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum admissions within any window
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Behavior when the window is saturated
    #[serde(default)]
    pub wait_policy: WaitPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            quota: default_quota(),
            wait_policy: WaitPolicy::default(),
        }
    }
}

fn default_interval_secs() -> u64 {
    1
}

fn default_quota() -> u64 {
    10
}

impl GateConfig {
    /// Create a new configuration.
    pub fn new(interval_secs: u64, quota: u64, wait_policy: WaitPolicy) -> Self {
        Self {
            interval_secs,
            quota,
            wait_policy,
        }
    }

    /// Check the invariants the gate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(SlidegateError::Config(
                "interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return Err(SlidegateError::Config(format!(
                "interval_secs must not exceed {} (got {})",
                MAX_INTERVAL_SECS, self.interval_secs
            )));
        }
        if self.quota == 0 {
            return Err(SlidegateError::Config(
                "quota must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The window width as a signed duration.
    pub fn interval(&self) -> Duration {
        // validate() bounds interval_secs well inside i64
        Duration::seconds(self.interval_secs as i64)
    }

    /// The window ending at `end`.
    pub fn window_ending_at(&self, end: DateTime<Utc>) -> SlidingWindow {
        SlidingWindow::ending_at(end, self.interval())
    }
}

/// A closed interval `[start, end]` of wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SlidingWindow {
    /// The window of width `interval` that ends at `end`.
    pub fn ending_at(end: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            start: end - interval,
            end,
        }
    }

    /// Shift both bounds forward by one search step.
    pub fn advance(self) -> Self {
        let step = Duration::seconds(SEARCH_STEP_SECS);
        Self {
            start: self.start + step,
            end: self.end + step,
        }
    }
}
