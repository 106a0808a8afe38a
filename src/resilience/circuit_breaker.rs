//! Circuit breaker implementation with lock-free atomics

use crate::resilience::clock::{Clock, MonotonicClock};
use crate::resilience::ResilienceError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the breaker
    pub failure_threshold: usize,
    /// How long the breaker stays open before admitting a probe
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            reset_timeout: Duration::from_secs(0),
            success_threshold: 1,
        }
    }
}

struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicUsize,
    half_open_successes: AtomicUsize,
}

/// Guards a callable against an unhealthy remote dependency.
///
/// Transitions follow CAS semantics: a trip is observed exactly once, and
/// exactly one probe is admitted per half-open window.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
            success_threshold: 1,
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicUsize::new(0),
                half_open_successes: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute) but only errors matching
    /// `counts_failure` advance the failure counter. Errors the predicate
    /// rejects pass through without affecting breaker state.
    pub async fn execute_when<T, E, Fut, Op, P>(
        &self,
        mut operation: Op,
        counts_failure: P,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        P: Fn(&ResilienceError<E>) -> bool + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.reset_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // We won the race: we are the probe
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_successes.store(0, Ordering::Release);
                                self.state.half_open_in_flight.store(1, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid breaker state"),
                        }
                    } else {
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    // Exactly one probe in flight; everyone else fails fast
                    let current = self.state.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if current >= 1 {
                        self.state.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_in_flight.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(e) => {
                if counts_failure(e) {
                    self.on_failure();
                }
            }
        }

        result
    }

    /// Execute `operation`, returning `fallback()` when the circuit is open
    /// or the operation fails.
    pub async fn execute_with_fallback<T, E, Fut, Op, FB>(&self, operation: Op, fallback: FB) -> T
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        FB: FnOnce() -> T + Send,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(_) => fallback(),
        }
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                let successes = self.state.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    if self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.state.failure_count.store(0, Ordering::Release);
                        self.state.opened_at_millis.store(0, Ordering::Release);
                        tracing::info!("circuit breaker -> closed");
                    }
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold {
                    if self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.state
                            .opened_at_millis
                            .store(self.clock.now_millis(), Ordering::Release);
                        tracing::error!(
                            failures,
                            threshold = self.config.failure_threshold,
                            "circuit breaker -> open"
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn fail() -> ResilienceError<TestError> {
        ResilienceError::Inner(TestError("fail".to_string()))
    }

    #[tokio::test]
    async fn starts_closed_and_passes_through() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let result =
            breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter_clone = counter.clone();
            let _ = breaker
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(fail())
                    }
                })
                .await;
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call fails fast without invoking the operation
        counter.store(0, Ordering::SeqCst);
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probes_after_reset_timeout_then_closes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(2, Duration::from_millis(100)).with_clock(clock.clone());

        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(150);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(100)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 100);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "probe should execute");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reopens_when_probe_fails() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(2, Duration::from_millis(100)).with_clock(clock.clone());

        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }
        clock.advance(150);

        let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn success_threshold_requires_consecutive_probes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(100),
            success_threshold: 2,
        })
        .with_clock(clock.clone());

        let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(150);

        // First probe succeeds but K=2, so still half-open
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(1) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second success closes
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(2) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(2, Duration::from_millis(100)).with_clock(clock.clone());

        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }
        clock.advance(150);

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..3 {
            let breaker_clone = breaker.clone();
            let counter_clone = counter.clone();
            handles.push(tokio::spawn(async move {
                breaker_clone
                    .execute(|| {
                        let counter = counter_clone.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ResilienceError<TestError>>(42)
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| {
                r.as_ref().unwrap().as_ref().err().map_or(false, |e| e.is_circuit_open())
            })
            .count();

        assert_eq!(successes, 1, "only the probe may run in half-open");
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn fallback_used_when_open() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(500));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let value = breaker
            .execute_with_fallback(
                || {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ResilienceError<TestError>>("live".to_string())
                    }
                },
                || "FB".to_string(),
            )
            .await;

        assert_eq!(value, "FB");
        assert_eq!(counter.load(Ordering::SeqCst), 0, "op must not run while open");
    }

    #[tokio::test]
    async fn fallback_used_on_operation_failure() {
        let breaker = CircuitBreaker::new(10, Duration::from_secs(1));
        let value = breaker
            .execute_with_fallback(|| async { Err::<String, _>(fail()) }, || "FB".to_string())
            .await;
        assert_eq!(value, "FB");
    }

    #[tokio::test]
    async fn uncounted_errors_do_not_trip() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));

        for _ in 0..5 {
            let _ = breaker
                .execute_when(
                    || async { Err::<(), _>(fail()) },
                    |e| !matches!(e, ResilienceError::Inner(inner) if inner.0 == "fail"),
                )
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successes_reset_failure_count_when_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));

        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }
        let _ = breaker.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;

        for _ in 0..2 {
            let result = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
            assert!(
                matches!(result, Err(ResilienceError::Inner(_))),
                "count was reset, so breaker must still be closed"
            );
        }
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig::disabled());
        for _ in 0..1000 {
            let _ = breaker.execute(|| async { Err::<(), _>(fail()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
