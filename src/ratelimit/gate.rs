//! The admission gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, trace, warn};

use super::decision::{Decision, Outcome};
use super::metrics::MetricsSink;
use crate::config::GateConfig;
use crate::error::GateError;
use crate::store::RateLimitStore;

/// Stateless decision logic in front of a [`RateLimitStore`].
///
/// Every call makes exactly one store attempt and one metrics record. The gate
/// never retries; contention is a terminal denial for that call.
#[derive(Clone)]
pub struct RateLimiterGate {
    store: Arc<dyn RateLimitStore>,
    metrics: Arc<dyn MetricsSink>,
    allowed_period: Duration,
    call_timeout: Option<Duration>,
}

impl RateLimiterGate {
    /// Create a gate enforcing `allowed_period` between permitted actions.
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        metrics: Arc<dyn MetricsSink>,
        allowed_period: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            allowed_period,
            call_timeout: None,
        }
    }

    /// Create a gate from configuration.
    pub fn from_config(
        store: Arc<dyn RateLimitStore>,
        metrics: Arc<dyn MetricsSink>,
        config: &GateConfig,
    ) -> Self {
        let gate = Self::new(store, metrics, config.allowed_period());
        match config.call_timeout() {
            Some(timeout) => gate.with_call_timeout(timeout),
            None => gate,
        }
    }

    /// Bound how long a caller waits for a decision.
    ///
    /// The decision itself keeps running past the deadline so the store
    /// releases its locks and the metrics see the real outcome.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn allowed_period(&self) -> Duration {
        self.allowed_period
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Decide whether `user_id` may act at `now`.
    pub async fn permit(&self, user_id: &str, now: DateTime<Utc>) -> Result<Decision, GateError> {
        let Some(timeout) = self.call_timeout else {
            return self.decide(user_id, now).await;
        };

        let gate = self.clone();
        let user = user_id.to_string();
        let decision = tokio::spawn(async move { gate.decide(&user, now).await });

        match tokio::time::timeout(timeout, decision).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                std::panic::resume_unwind(join_err.into_panic())
            }
            Ok(Err(_)) => Err(GateError::OutcomeUnknown(timeout)),
            Err(_) => {
                warn!(
                    user = %user_id,
                    timeout = ?timeout,
                    "Decision deadline elapsed; outcome unknown"
                );
                Err(GateError::OutcomeUnknown(timeout))
            }
        }
    }

    /// Decide whether `user_id` may act now, by the local wall clock.
    pub async fn permit_now(&self, user_id: &str) -> Result<Decision, GateError> {
        self.permit(user_id, Utc::now()).await
    }

    async fn decide(&self, user_id: &str, now: DateTime<Utc>) -> Result<Decision, GateError> {
        let started = Instant::now();

        if user_id.is_empty() {
            warn!("Rejected permit request with empty user id");
            self.metrics
                .record(user_id, Outcome::InvalidRequest, started.elapsed());
            return Err(GateError::InvalidUser);
        }

        trace!(
            user = %user_id,
            now = %now,
            strategy = %self.store.strategy(),
            "Trying to acquire permit"
        );

        let result = self
            .store
            .try_permit(user_id, now, self.allowed_period)
            .await
            .map(Decision::from)
            .map_err(GateError::from);

        let outcome = match &result {
            Ok(decision) => Outcome::from(*decision),
            Err(_) => Outcome::StorageFailure,
        };
        self.metrics.record(user_id, outcome, started.elapsed());

        match &result {
            Ok(Decision::Allowed) => debug!(user = %user_id, "Permit granted"),
            Ok(Decision::Denied(reason)) => {
                debug!(user = %user_id, reason = ?reason, "Permit denied")
            }
            Err(e) => error!(user = %user_id, error = %e, "Permit decision failed"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::decision::DenialReason;
    use crate::ratelimit::metrics::PrometheusSink;
    use crate::store::tests::{at, memory_stores};
    use crate::store::{MemoryUpsertStore, StoreOutcome, StoreStrategy};
    use async_trait::async_trait;
    use futures::future::join_all;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const PERIOD: Duration = Duration::from_secs(2);

    fn test_sink() -> Arc<PrometheusSink> {
        Arc::new(PrometheusSink::new(&Registry::new()).unwrap())
    }

    fn gate_with(store: Arc<dyn RateLimitStore>, sink: Arc<PrometheusSink>) -> RateLimiterGate {
        RateLimiterGate::new(store, sink, PERIOD)
    }

    /// Store double returning a fixed answer and counting attempts.
    struct ScriptedStore {
        answer: fn() -> Result<StoreOutcome, StoreError>,
        delay: Duration,
        attempts: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(answer: fn() -> Result<StoreOutcome, StoreError>) -> Self {
            Self {
                answer,
                delay: Duration::ZERO,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RateLimitStore for ScriptedStore {
        async fn try_permit(
            &self,
            _user_id: &str,
            _now: DateTime<Utc>,
            _allowed_period: Duration,
        ) -> Result<StoreOutcome, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.answer)()
        }

        async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn last_permitted_at(
            &self,
            _user_id: &str,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            Ok(None)
        }

        fn strategy(&self) -> StoreStrategy {
            StoreStrategy::Locking
        }
    }

    #[tokio::test]
    async fn test_alex_scenario() {
        for store in memory_stores() {
            let gate = gate_with(store, test_sink());

            assert_eq!(assert_ok!(gate.permit("alex", at(0)).await), Decision::Allowed);
            assert_eq!(
                assert_ok!(gate.permit("alex", at(1000)).await),
                Decision::Denied(DenialReason::PeriodNotElapsed)
            );
            assert_eq!(assert_ok!(gate.permit("alex", at(2001)).await), Decision::Allowed);
        }
    }

    #[tokio::test]
    async fn test_two_users_at_same_instant() {
        for store in memory_stores() {
            let gate = gate_with(store, test_sink());
            assert_eq!(assert_ok!(gate.permit("alex", at(0)).await), Decision::Allowed);
            assert_eq!(assert_ok!(gate.permit("sam", at(0)).await), Decision::Allowed);
        }
    }

    #[tokio::test]
    async fn test_elapsed_period_always_allows() {
        for store in memory_stores() {
            let gate = gate_with(store, test_sink());
            let mut last_allowed = None;
            for offset in (0..30_000).step_by(700) {
                let decision = assert_ok!(gate.permit("alex", at(offset)).await);
                if let Some(last) = last_allowed {
                    if offset - last >= 2000 {
                        assert_eq!(decision, Decision::Allowed);
                    }
                }
                if decision.is_allowed() {
                    last_allowed = Some(offset);
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_one_permit() {
        const CALLERS: usize = 32;

        for store in memory_stores() {
            let sink = test_sink();
            let gate = gate_with(store, sink.clone());

            let calls = (0..CALLERS).map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.permit("alex", at(0)).await })
            });
            let decisions: Vec<Decision> = join_all(calls)
                .await
                .into_iter()
                .map(|joined| joined.unwrap().unwrap())
                .collect();

            assert_eq!(decisions.iter().filter(|d| d.is_allowed()).count(), 1);
            assert_eq!(sink.event_count("alex", "success"), 1);
            assert_eq!(sink.event_count("alex", "failure"), (CALLERS - 1) as u64);
        }
    }

    #[tokio::test]
    async fn test_contention_is_a_denial() {
        let store = Arc::new(ScriptedStore::new(|| Ok(StoreOutcome::Contention)));
        let sink = test_sink();
        let gate = gate_with(store.clone(), sink.clone());

        let decision = assert_ok!(gate.permit("alex", at(0)).await);
        assert_eq!(decision, Decision::Denied(DenialReason::Contention));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.event_count("alex", "failure"), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_a_denial() {
        let store = Arc::new(ScriptedStore::new(|| {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }));
        let sink = test_sink();
        let gate = gate_with(store.clone(), sink.clone());

        let err = assert_err!(gate.permit("alex", at(0)).await);
        assert!(matches!(err, GateError::Storage(StoreError::Unavailable(_))));
        // No retry inside the gate.
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.event_count("alex", "failure"), 1);
        assert_eq!(sink.duration_samples(), 1);
    }

    #[tokio::test]
    async fn test_empty_user_rejected_before_store() {
        let store = Arc::new(ScriptedStore::new(|| Ok(StoreOutcome::Written)));
        let sink = test_sink();
        let gate = gate_with(store.clone(), sink.clone());

        let err = assert_err!(gate.permit("", at(0)).await);
        assert!(matches!(err, GateError::InvalidUser));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(sink.duration_samples(), 1);
    }

    #[tokio::test]
    async fn test_every_call_recorded_once() {
        let sink = test_sink();
        let gate = gate_with(Arc::new(MemoryUpsertStore::new()), sink.clone());

        for offset in [0, 500, 1000, 2500, 2600] {
            gate.permit("alex", at(offset)).await.unwrap();
        }

        assert_eq!(sink.event_count("alex", "success"), 2);
        assert_eq!(sink.event_count("alex", "failure"), 3);
        assert_eq!(sink.duration_samples(), 5);
    }

    #[tokio::test]
    async fn test_timed_out_call_still_completes() {
        let mut slow = ScriptedStore::new(|| Ok(StoreOutcome::Written));
        slow.delay = Duration::from_millis(200);
        let store = Arc::new(slow);
        let sink = test_sink();
        let gate = gate_with(store.clone(), sink.clone())
            .with_call_timeout(Duration::from_millis(20));

        let err = assert_err!(gate.permit("alex", at(0)).await);
        assert!(matches!(err, GateError::OutcomeUnknown(_)));
        assert_eq!(sink.duration_samples(), 0);

        // The decision finishes in the background and is recorded once.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.event_count("alex", "success"), 1);
        assert_eq!(sink.duration_samples(), 1);
    }

    #[tokio::test]
    async fn test_call_within_timeout_returns_decision() {
        let sink = test_sink();
        let config = GateConfig {
            allowed_period_ms: 2000,
            call_timeout_ms: Some(1000),
            ..GateConfig::default()
        };
        let gate = RateLimiterGate::from_config(Arc::new(MemoryUpsertStore::new()), sink, &config);

        assert_eq!(gate.allowed_period(), PERIOD);
        assert_eq!(assert_ok!(gate.permit("alex", at(0)).await), Decision::Allowed);
        assert_eq!(
            assert_ok!(gate.permit("alex", at(100)).await),
            Decision::Denied(DenialReason::PeriodNotElapsed)
        );
    }
}
