//! Named recovery strategies composing retry, circuit breaking, and fallback
//!
//! A strategy is a pre-parameterized retry policy wrapping a shared circuit
//! breaker; callers pick one by name instead of re-deriving tuning constants
//! at every call site.

use crate::resilience::{BackoffSchedule, CircuitBreaker, Jitter, ResilienceError, RetryPolicy};
use crate::shutdown::ShutdownToken;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Retry + circuit breaker under a single name.
pub struct RecoveryStrategy<E> {
    name: String,
    retry: RetryPolicy<E>,
    breaker: CircuitBreaker,
}

impl<E> RecoveryStrategy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, retry: RetryPolicy<E>, breaker: CircuitBreaker) -> Self {
        Self { name: name.into(), retry, breaker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` under retry with the breaker inside: an open circuit
    /// fails fast and is not retried.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op_cell.clone();
                let breaker = self.breaker.clone();
                async move {
                    breaker
                        .execute(|| {
                            let mut op = op.lock().unwrap_or_else(|p| p.into_inner());
                            op()
                        })
                        .await
                }
            })
            .await
    }

    /// Like [`execute`](Self::execute) but absorbing failures into `fallback`.
    pub async fn execute_with_fallback<T, Fut, Op, FB>(&self, operation: Op, fallback: FB) -> T
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        FB: FnOnce() -> T + Send,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(strategy = %self.name, error = %e, "recovery fell back");
                fallback()
            }
        }
    }
}

/// Registry of named strategies; one per process context.
pub struct RecoveryManager<E> {
    strategies: HashMap<String, RecoveryStrategy<E>>,
}

impl<E> RecoveryManager<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Build the standard strategy set.
    pub fn new() -> Self {
        Self::with_shutdown(None)
    }

    /// Build the standard strategy set; retries observe `shutdown` if given.
    pub fn with_shutdown(shutdown: Option<ShutdownToken>) -> Self {
        Self::customized(shutdown, |_| true, |_| None)
    }

    /// Build the standard strategy set with a shared retry predicate and
    /// retry-after hint applied to every strategy.
    pub fn customized<P, H>(shutdown: Option<ShutdownToken>, should_retry: P, retry_after: H) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + Clone + 'static,
        H: Fn(&E) -> Option<Duration> + Send + Sync + Clone + 'static,
    {
        let retry = |attempts: usize, backoff: BackoffSchedule, jitter: Jitter| {
            let mut builder = RetryPolicy::builder()
                .max_attempts(attempts)
                .expect("attempts > 0")
                .backoff(backoff)
                .with_jitter(jitter)
                .should_retry(should_retry.clone())
                .retry_after_hint(retry_after.clone());
            if let Some(token) = &shutdown {
                builder = builder.with_shutdown(token.clone());
            }
            builder.build()
        };

        let mut strategies = HashMap::new();
        let mut insert = |name: &str, retry: RetryPolicy<E>, breaker: CircuitBreaker| {
            strategies.insert(name.to_string(), RecoveryStrategy::new(name, retry, breaker));
        };

        insert(
            "network",
            retry(
                3,
                BackoffSchedule::exponential(Duration::from_millis(200)).with_max(Duration::from_secs(5)),
                Jitter::Bounded,
            ),
            CircuitBreaker::new(5, Duration::from_secs(10)),
        );
        insert(
            "critical",
            retry(
                5,
                BackoffSchedule::exponential(Duration::from_millis(500)).with_max(Duration::from_secs(30)),
                Jitter::Bounded,
            ),
            CircuitBreaker::new(10, Duration::from_secs(30)),
        );
        insert(
            "fast",
            retry(2, BackoffSchedule::fixed(Duration::from_millis(100)), Jitter::None),
            CircuitBreaker::new(3, Duration::from_secs(5)),
        );
        insert(
            "tracker",
            retry(
                3,
                BackoffSchedule::exponential(Duration::from_millis(250)).with_max(Duration::from_secs(5)),
                Jitter::Bounded,
            ),
            CircuitBreaker::new(5, Duration::from_secs(15)),
        );
        insert(
            "index-server",
            retry(
                3,
                BackoffSchedule::exponential(Duration::from_millis(250)).with_max(Duration::from_secs(5)),
                Jitter::Bounded,
            ),
            CircuitBreaker::new(5, Duration::from_secs(15)),
        );
        insert(
            "peer",
            retry(
                4,
                BackoffSchedule::exponential(Duration::from_millis(200)).with_max(Duration::from_secs(10)),
                Jitter::Bounded,
            ),
            CircuitBreaker::new(3, Duration::from_secs(20)),
        );

        Self { strategies }
    }

    pub fn strategy(&self, name: &str) -> Option<&RecoveryStrategy<E>> {
        self.strategies.get(name)
    }

    /// Replace or add a strategy under its own name.
    pub fn insert(&mut self, strategy: RecoveryStrategy<E>) {
        self.strategies.insert(strategy.name.clone(), strategy);
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

impl<E> Default for RecoveryManager<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
