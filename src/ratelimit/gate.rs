//! Core admission gate implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::context::{until, CallContext};
use super::sender::Sender;
use super::window::{GateConfig, WaitPolicy};
use crate::error::{DispatchError, Result};
use crate::store::CounterStore;

/// A sliding-window rate limiter in front of a [`Sender`].
///
/// At most `quota` calls are admitted in any trailing window of
/// `interval_secs` seconds. Calls over the quota are either rejected or held
/// until the window has room, depending on the [`WaitPolicy`].
///
/// The gate is safe to share across tasks. Two callers racing on the same
/// window can both be admitted unless the store makes its count and
/// increment linearizable.
pub struct Gate<S> {
    /// The wrapped client
    sender: S,
    /// Where admissions are counted
    store: Arc<dyn CounterStore>,
    /// Current settings, copied out once per call
    config: RwLock<GateConfig>,
}

impl<S> std::fmt::Debug for Gate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl<S: Sender> Gate<S> {
    /// Create a new gate.
    pub fn new(
        sender: S,
        interval_secs: u64,
        quota: u64,
        store: Arc<dyn CounterStore>,
        wait_policy: WaitPolicy,
    ) -> Result<Self> {
        Self::with_config(
            sender,
            store,
            GateConfig::new(interval_secs, quota, wait_policy),
        )
    }

    /// Create a new gate from a configuration value.
    pub fn with_config(sender: S, store: Arc<dyn CounterStore>, config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sender,
            store,
            config: RwLock::new(config),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> GateConfig {
        *self.config.read()
    }

    /// Replace the whole configuration.
    ///
    /// Calls already past their snapshot keep the settings they started with.
    pub fn set_config(&self, config: GateConfig) -> Result<()> {
        self.update(|current| *current = config)
    }

    /// Change the window width.
    pub fn set_interval_secs(&self, interval_secs: u64) -> Result<()> {
        self.update(|config| config.interval_secs = interval_secs)
    }

    /// Change the number of admissions allowed per window.
    pub fn set_quota(&self, quota: u64) -> Result<()> {
        self.update(|config| config.quota = quota)
    }

    /// Change what happens when the window is saturated.
    pub fn set_wait_policy(&self, wait_policy: WaitPolicy) -> Result<()> {
        self.update(|config| config.wait_policy = wait_policy)
    }

    /// Apply a change to a copy of the configuration and swap it in if the
    /// result is valid.
    fn update(&self, apply: impl FnOnce(&mut GateConfig)) -> Result<()> {
        let updated = {
            let mut config = self.config.write();
            let mut next = *config;
            apply(&mut next);
            next.validate()?;
            *config = next;
            next
        };
        debug!(
            interval_secs = updated.interval_secs,
            quota = updated.quota,
            wait_policy = ?updated.wait_policy,
            "Gate configuration updated"
        );
        Ok(())
    }

    /// Admit `request` through the gate and send it.
    ///
    /// Returns the sender's response, or why the call was not sent. A call
    /// that is admitted consumes quota even if the sender then fails.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        request: S::Request,
    ) -> std::result::Result<S::Response, DispatchError<S::Error>> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let config = self.config();
        let now = Utc::now();
        let window = config.window_ending_at(now);

        let count = self
            .store
            .count_in_interval(window.start, window.end)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to query admission count");
                DispatchError::CountQueryFailed(e)
            })?;

        trace!(
            count = count,
            quota = config.quota,
            interval_secs = config.interval_secs,
            "Checked admission window"
        );

        if count < config.quota {
            return self.admit(now, request).await;
        }

        match config.wait_policy {
            WaitPolicy::RejectImmediately => {
                debug!(count = count, quota = config.quota, "Rate limit exceeded");
                Err(DispatchError::RateLimitExceeded)
            }
            WaitPolicy::WaitForOpening => {
                let opening = self.wait_for_opening(ctx, &config, now).await?;
                self.admit(opening, request).await
            }
        }
    }

    /// Record the admission at `at`, then hand the request to the sender.
    async fn admit(
        &self,
        at: DateTime<Utc>,
        request: S::Request,
    ) -> std::result::Result<S::Response, DispatchError<S::Error>> {
        self.store.increment(at).await.map_err(|e| {
            warn!(error = %e, "Failed to record admission");
            DispatchError::CountIncrementFailed(e)
        })?;

        self.sender.send(request).await.map_err(DispatchError::Sender)
    }

    /// Find the next opening and block until it arrives.
    async fn wait_for_opening(
        &self,
        ctx: &CallContext,
        config: &GateConfig,
        now: DateTime<Utc>,
    ) -> std::result::Result<DateTime<Utc>, DispatchError<S::Error>> {
        let opening = self
            .store
            .find_next_opening(now, config.interval(), config.quota)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to search for next opening");
                DispatchError::CountQueryFailed(e)
            })?;

        if let Some(deadline) = ctx.deadline() {
            if opening > deadline {
                debug!(%opening, %deadline, "Next opening is past the caller deadline");
                return Err(DispatchError::WaitWouldExceedDeadline { opening, deadline });
            }
        }

        let delay = until(opening);
        debug!(%opening, wait_ms = delay.as_millis() as u64, "Waiting for next opening");

        tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            _ = tokio::time::sleep(delay) => {}
        }

        // A context that ends as the opening arrives reports its own error.
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        Ok(opening)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ContextError;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio_test::{assert_err, assert_ok, assert_pending};

    #[derive(Debug, thiserror::Error)]
    #[error("transport failure")]
    struct TransportError;

    /// Sender that counts calls and optionally fails them.
    #[derive(Default)]
    struct CountingSender {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSender {
        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sender for CountingSender {
        type Request = u32;
        type Response = u32;
        type Error = TransportError;

        async fn send(&self, request: u32) -> std::result::Result<u32, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError)
            } else {
                Ok(request)
            }
        }
    }

    /// Store wrapper that counts every call reaching it and can fail the
    /// Nth query or increment.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        queries: AtomicUsize,
        increments: AtomicUsize,
        fail_query_at: Option<usize>,
        fail_increment_at: Option<usize>,
    }

    impl RecordingStore {
        fn failing_query(n: usize) -> Self {
            Self {
                fail_query_at: Some(n),
                ..Default::default()
            }
        }

        fn failing_increment(n: usize) -> Self {
            Self {
                fail_increment_at: Some(n),
                ..Default::default()
            }
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        fn increments(&self) -> usize {
            self.increments.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CounterStore for RecordingStore {
        async fn count_in_interval(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> std::result::Result<u64, StoreError> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_query_at == Some(n) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.count_in_interval(start, end).await
        }

        async fn increment(&self, instant: DateTime<Utc>) -> std::result::Result<(), StoreError> {
            let n = self.increments.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_increment_at == Some(n) {
                return Err(StoreError::Backend("write rejected".to_string()));
            }
            self.inner.increment(instant).await
        }
    }

    fn create_gate(
        interval_secs: u64,
        quota: u64,
        wait_policy: WaitPolicy,
    ) -> (Gate<Arc<CountingSender>>, Arc<CountingSender>, Arc<RecordingStore>) {
        create_gate_with_store(RecordingStore::default(), interval_secs, quota, wait_policy)
    }

    fn create_gate_with_store(
        store: RecordingStore,
        interval_secs: u64,
        quota: u64,
        wait_policy: WaitPolicy,
    ) -> (Gate<Arc<CountingSender>>, Arc<CountingSender>, Arc<RecordingStore>) {
        let sender = Arc::new(CountingSender::default());
        let store = Arc::new(store);
        let gate = Gate::new(
            sender.clone(),
            interval_secs,
            quota,
            store.clone(),
            wait_policy,
        )
        .unwrap();
        (gate, sender, store)
    }

    #[test]
    fn test_gate_rejects_invalid_config() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let gate = Gate::new(
            CountingSender::default(),
            0,
            1,
            store.clone(),
            WaitPolicy::RejectImmediately,
        );
        assert!(gate.is_err());

        let gate = Gate::new(CountingSender::default(), 1, 0, store, WaitPolicy::WaitForOpening);
        assert!(gate.is_err());
    }

    #[tokio::test]
    async fn test_quota_calls_are_all_admitted() {
        let (gate, sender, store) = create_gate(10, 5, WaitPolicy::RejectImmediately);
        let ctx = CallContext::new();

        for i in 0..5 {
            let response = assert_ok!(gate.dispatch(&ctx, i).await);
            assert_eq!(response, i);
        }

        assert_eq!(sender.calls(), 5);
        assert_eq!(store.inner.len(), 5);
    }

    #[tokio::test]
    async fn test_reject_over_quota() {
        let table = [(10, 50, 50, 50), (10, 50, 100, 50), (10, 40, 100, 40)];

        for (interval_secs, quota, requested, expected) in table {
            let (gate, sender, _store) =
                create_gate(interval_secs, quota, WaitPolicy::RejectImmediately);
            let ctx = CallContext::new();

            let mut rejected = 0;
            for i in 0..requested {
                match gate.dispatch(&ctx, i).await {
                    Ok(_) => {}
                    Err(DispatchError::RateLimitExceeded) => rejected += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }

            assert_eq!(sender.calls(), expected as usize);
            assert_eq!(rejected, requested - expected);
        }
    }

    #[tokio::test]
    async fn test_reject_returns_immediately() {
        let (gate, sender, store) = create_gate(2, 1, WaitPolicy::RejectImmediately);
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);

        let started = Instant::now();
        let err = assert_err!(gate.dispatch(&ctx, 2).await);
        assert!(matches!(err, DispatchError::RateLimitExceeded));
        assert!(err.is_rate_limited());
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(sender.calls(), 1);
        assert_eq!(store.increments(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_opening() {
        let (gate, sender, store) = create_gate(2, 1, WaitPolicy::WaitForOpening);
        let ctx = CallContext::new();

        let started = Instant::now();
        assert_ok!(gate.dispatch(&ctx, 1).await);
        assert_ok!(gate.dispatch(&ctx, 2).await);

        assert!(started.elapsed() >= Duration::from_millis(1900));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(sender.calls(), 2);
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_waiting_call_is_pending() {
        let (gate, sender, _store) = create_gate(5, 1, WaitPolicy::WaitForOpening);
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);

        let mut waiting = tokio_test::task::spawn(gate.dispatch(&ctx, 2));
        assert_pending!(waiting.poll());
        assert_eq!(sender.calls(), 1);

        ctx.cancel();
        drop(waiting);
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_store() {
        let (gate, sender, store) = create_gate(1, 1, WaitPolicy::WaitForOpening);
        let ctx = CallContext::new().with_deadline(Utc::now() - chrono::Duration::seconds(1));

        let err = assert_err!(gate.dispatch(&ctx, 1).await);
        assert!(matches!(err, DispatchError::Context(ContextError::DeadlineExceeded)));

        assert_eq!(store.queries(), 0);
        assert_eq!(store.increments(), 0);
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn test_canceled_context_skips_store() {
        let (gate, sender, store) = create_gate(1, 1, WaitPolicy::RejectImmediately);
        let ctx = CallContext::new();
        ctx.cancel();

        let err = assert_err!(gate.dispatch(&ctx, 1).await);
        assert!(matches!(err, DispatchError::Context(ContextError::Canceled)));
        assert_eq!(store.queries(), 0);
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn test_wait_past_deadline_fails_fast() {
        let (gate, sender, store) = create_gate(1, 1, WaitPolicy::WaitForOpening);
        let ctx = CallContext::new().with_timeout(Duration::from_millis(500));

        assert_ok!(gate.dispatch(&ctx, 1).await);

        let started = Instant::now();
        let err = assert_err!(gate.dispatch(&ctx, 2).await);
        assert!(matches!(err, DispatchError::WaitWouldExceedDeadline { .. }));
        assert!(started.elapsed() < Duration::from_millis(400));

        assert_eq!(sender.calls(), 1);
        assert_eq!(store.increments(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (gate, sender, store) = create_gate(5, 1, WaitPolicy::WaitForOpening);
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);

        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceler.cancel();
        });

        let started = Instant::now();
        let err = assert_err!(gate.dispatch(&ctx, 2).await);
        assert!(matches!(err, DispatchError::Context(ContextError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(sender.calls(), 1);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_store_query_failure() {
        let (gate, sender, store) = create_gate_with_store(
            RecordingStore::failing_query(1),
            1,
            1,
            WaitPolicy::RejectImmediately,
        );

        let err = assert_err!(gate.dispatch(&CallContext::new(), 1).await);
        assert!(matches!(err, DispatchError::CountQueryFailed(StoreError::Unavailable(_))));
        assert!(err.is_infrastructure());
        assert_eq!(store.increments(), 0);
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_increment_failure() {
        let (gate, sender, store) = create_gate_with_store(
            RecordingStore::failing_increment(1),
            1,
            1,
            WaitPolicy::RejectImmediately,
        );

        let err = assert_err!(gate.dispatch(&CallContext::new(), 1).await);
        assert!(matches!(err, DispatchError::CountIncrementFailed(StoreError::Backend(_))));
        assert!(store.inner.is_empty());
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_while_searching_for_opening() {
        // Queries 1 and 2 admit, query 3 finds the window full, and the
        // search fails on its third step.
        let (gate, sender, store) = create_gate_with_store(
            RecordingStore::failing_query(6),
            5,
            2,
            WaitPolicy::WaitForOpening,
        );
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);
        assert_ok!(gate.dispatch(&ctx, 2).await);

        let started = Instant::now();
        let err = assert_err!(gate.dispatch(&ctx, 3).await);
        assert!(matches!(err, DispatchError::CountQueryFailed(StoreError::Unavailable(_))));
        assert!(err.is_infrastructure());
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(store.queries(), 6);
        assert_eq!(store.increments(), 2);
        assert_eq!(store.inner.len(), 2);
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test]
    async fn test_increment_failure_after_wait() {
        let (gate, sender, store) = create_gate_with_store(
            RecordingStore::failing_increment(2),
            1,
            1,
            WaitPolicy::WaitForOpening,
        );
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);

        let started = Instant::now();
        let err = assert_err!(gate.dispatch(&ctx, 2).await);
        assert!(matches!(err, DispatchError::CountIncrementFailed(StoreError::Backend(_))));
        assert!(err.is_infrastructure());
        assert!(started.elapsed() >= Duration::from_millis(500));

        assert!(store.queries() > 2, "the search ran before the increment");
        assert_eq!(store.inner.len(), 1);
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn test_sender_failure_still_consumes_quota() {
        let sender = Arc::new(CountingSender::failing());
        let store = Arc::new(MemoryStore::new());
        let gate = Gate::new(
            sender.clone(),
            10,
            1,
            store.clone(),
            WaitPolicy::RejectImmediately,
        )
        .unwrap();
        let ctx = CallContext::new();

        let err = assert_err!(gate.dispatch(&ctx, 1).await);
        assert!(matches!(err, DispatchError::Sender(TransportError)));
        assert_eq!(store.len(), 1);

        let err = assert_err!(gate.dispatch(&ctx, 2).await);
        assert!(matches!(err, DispatchError::RateLimitExceeded));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn test_config_updates_apply_to_next_call() {
        let (gate, sender, _store) = create_gate(10, 1, WaitPolicy::RejectImmediately);
        let ctx = CallContext::new();

        assert_ok!(gate.dispatch(&ctx, 1).await);
        assert_err!(gate.dispatch(&ctx, 2).await);

        gate.set_quota(2).unwrap();
        assert_ok!(gate.dispatch(&ctx, 3).await);
        assert_eq!(sender.calls(), 2);

        assert!(gate.set_quota(0).is_err());
        assert!(gate.set_interval_secs(0).is_err());
        assert_eq!(gate.config(), GateConfig::new(10, 2, WaitPolicy::RejectImmediately));

        gate.set_wait_policy(WaitPolicy::WaitForOpening).unwrap();
        assert_eq!(gate.config().wait_policy, WaitPolicy::WaitForOpening);

        assert!(gate.set_config(GateConfig::new(3, 0, WaitPolicy::RejectImmediately)).is_err());
        gate.set_config(GateConfig::new(3, 4, WaitPolicy::RejectImmediately))
            .unwrap();
        assert_eq!(gate.config(), GateConfig::new(3, 4, WaitPolicy::RejectImmediately));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_are_all_sent() {
        let sender = Arc::new(CountingSender::default());
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(
            Gate::new(
                sender.clone(),
                1,
                2,
                store.clone(),
                WaitPolicy::WaitForOpening,
            )
            .unwrap(),
        );
        let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { gate.dispatch(&ctx, i).await }));
        }

        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }
        assert_eq!(sender.calls(), 4);
        assert_eq!(store.len(), 4);
    }
}
