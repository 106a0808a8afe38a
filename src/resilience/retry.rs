//! Retry policy implementation
//!
//! A policy owns its backoff schedule (fixed, linear, or exponential growth
//! clamped to a ceiling), a jitter strategy, a retry predicate, and an
//! optional retry-after hint extractor. Sleeps go through the `Sleeper`
//! seam so tests stay deterministic, and a shutdown token cancels between
//! attempts without side effects.

use crate::resilience::error::MAX_RETRY_FAILURES;
use crate::resilience::{Jitter, ResilienceError};
use crate::shutdown::ShutdownToken;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Delays never grow past this unless a schedule raises it explicitly.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows by the initial amount each attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// An initial delay grown per attempt by a [`RetryStrategy`] and clamped to
/// a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    strategy: RetryStrategy,
    initial: Duration,
    max: Duration,
}

impl BackoffSchedule {
    pub fn fixed(delay: Duration) -> Self {
        Self { strategy: RetryStrategy::Fixed, initial: delay, max: delay }
    }

    pub fn linear(initial: Duration) -> Self {
        Self { strategy: RetryStrategy::Linear, initial, max: DEFAULT_MAX_BACKOFF }
    }

    pub fn exponential(initial: Duration) -> Self {
        Self { strategy: RetryStrategy::Exponential, initial, max: DEFAULT_MAX_BACKOFF }
    }

    /// Raise or lower the delay ceiling.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-indexed), pre-jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial.as_millis() as u64;
        let grown = match self.strategy {
            RetryStrategy::Fixed => initial,
            RetryStrategy::Linear => initial.saturating_mul(u64::from(attempt)),
            RetryStrategy::Exponential => match 1u64.checked_shl(attempt.saturating_sub(1)) {
                Some(factor) => initial.saturating_mul(factor),
                None => u64::MAX,
            },
        };
        Duration::from_millis(grown).min(self.max)
    }
}

/// Waits between attempts; swapped out in tests for determinism.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Default sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerSleeper;

#[async_trait]
impl Sleeper for TimerSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: BackoffSchedule,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    retry_after: Arc<dyn Fn(&E) -> Option<Duration> + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Option<ShutdownToken>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();
        let mut last_backoff = None;

        for attempt in 0..self.max_attempts {
            if let Some(token) = &self.shutdown {
                if token.is_cancelled() {
                    return Err(ResilienceError::Cancelled);
                }
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => {
                    if !(self.should_retry)(&e) {
                        return Err(ResilienceError::Inner(e));
                    }

                    let hint = (self.retry_after)(&e);
                    failures.push(e);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt + 1 >= self.max_attempts {
                        return Err(ResilienceError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                            last_backoff,
                        });
                    }

                    // delay_for is 1-indexed; a retry-after hint wins when larger
                    let mut delay =
                        self.jitter.apply(self.backoff.delay_for(attempt as u32 + 1));
                    if let Some(hint) = hint {
                        delay = delay.max(hint);
                    }
                    last_backoff = Some(delay);

                    self.sleep_observing_shutdown(delay).await?;
                }
                // Non-Inner errors (Timeout, CircuitOpen, ...) are not retried
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop returns from its final attempt")
    }

    async fn sleep_observing_shutdown(&self, delay: Duration) -> Result<(), ResilienceError<E>> {
        match &self.shutdown {
            None => {
                self.sleeper.sleep(delay).await;
                Ok(())
            }
            Some(token) => {
                tokio::select! {
                    _ = self.sleeper.sleep(delay) => Ok(()),
                    _ = token.cancelled() => Err(ResilienceError::Cancelled),
                }
            }
        }
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: BackoffSchedule,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    retry_after: Arc<dyn Fn(&E) -> Option<Duration> + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Option<ShutdownToken>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffSchedule::exponential(Duration::from_secs(1)),
            jitter: Jitter::Full,
            should_retry: Arc::new(|_| true),
            retry_after: Arc::new(|_| None),
            sleeper: Arc::new(TimerSleeper),
            shutdown: None,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, schedule: BackoffSchedule) -> Self {
        self.backoff = schedule;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Extract a server-supplied retry-after hint from an error. The hint is
    /// honored when it exceeds the computed backoff.
    pub fn retry_after_hint<F>(mut self, extract: F) -> Self
    where
        F: Fn(&E) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_after = Arc::new(extract);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            retry_after: self.retry_after,
            sleeper: self.sleeper,
            shutdown: self.shutdown,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownController;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    /// Records requested delays and returns immediately.
    #[derive(Clone, Default)]
    struct RecordingSleeper {
        slept: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        fn new() -> Self {
            Self::default()
        }

        fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.slept.lock().unwrap().push(delay);
        }
    }

    #[test]
    fn fixed_schedule_never_grows() {
        let schedule = BackoffSchedule::fixed(Duration::from_secs(1));
        assert_eq!(schedule.delay_for(1), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(7), Duration::from_secs(1));
        assert_eq!(schedule.strategy(), RetryStrategy::Fixed);
    }

    #[test]
    fn linear_schedule_grows_by_the_initial_step() {
        let schedule = BackoffSchedule::linear(Duration::from_millis(100));
        assert_eq!(schedule.delay_for(1), Duration::from_millis(100));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(200));
        assert_eq!(schedule.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_schedule_doubles_until_the_ceiling() {
        let schedule = BackoffSchedule::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1));
        assert_eq!(schedule.delay_for(1), Duration::from_millis(100));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(200));
        assert_eq!(schedule.delay_for(4), Duration::from_millis(800));
        assert_eq!(schedule.delay_for(5), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn schedules_cap_at_the_default_ceiling() {
        let schedule = BackoffSchedule::exponential(Duration::from_secs(1));
        assert_eq!(schedule.delay_for(64), DEFAULT_MAX_BACKOFF);

        let linear = BackoffSchedule::linear(Duration::from_secs(30));
        assert_eq!(linear.delay_for(1000), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn huge_attempt_numbers_saturate_instead_of_overflowing() {
        let schedule =
            BackoffSchedule::exponential(Duration::from_secs(1)).with_max(Duration::MAX);
        assert!(schedule.delay_for(u32::MAX) > Duration::from_secs(1_000_000));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(100)))
            .with_sleeper(RecordingSleeper::new())
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should only execute once");
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(10)))
            .with_sleeper(RecordingSleeper::new())
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(ResilienceError::Inner(TestError(format!("attempt {}", attempt))))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should succeed on 3rd attempt");
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(10)))
            .with_jitter(Jitter::None)
            .with_sleeper(RecordingSleeper::new())
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::Inner(TestError(format!("attempt {}", attempt))))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should attempt 3 times");

        match result.unwrap_err() {
            ResilienceError::RetryExhausted { attempts, failures, last_backoff } => {
                assert_eq!(attempts, 3);
                assert_eq!(failures.len(), 3);
                assert_eq!(failures[2].0, "attempt 2");
                assert_eq!(last_backoff, Some(Duration::from_millis(10)));
            }
            e => panic!("Expected RetryExhausted, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_backoff_applied() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::linear(Duration::from_millis(100)))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build();

        let _ = policy
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("always fail".to_string())))
            })
            .await;

        // Linear backoff: 100ms, 200ms, 300ms between the 4 attempts
        assert_eq!(
            sleeper.slept(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[tokio::test]
    async fn test_should_retry_predicate() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(10)))
            .with_sleeper(RecordingSleeper::new())
            .should_retry(|e: &TestError| e.0.contains("retryable"))
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::Inner(TestError("fatal error".to_string())))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should not retry non-retryable error");
    }

    #[tokio::test]
    async fn test_retry_after_hint_raises_backoff() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(10)))
            .with_jitter(Jitter::None)
            .retry_after_hint(|_: &TestError| Some(Duration::from_millis(250)))
            .with_sleeper(sleeper.clone())
            .build();

        let _ = policy
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("rate limited".to_string())))
            })
            .await;

        // Hint (250ms) exceeds computed backoff (10ms) so it wins
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_millis(250), Duration::from_millis(250)]
        );
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let ctrl = ShutdownController::new();
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_secs(60)))
            .with_jitter(Jitter::None)
            .with_shutdown(ctrl.token())
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = tokio::spawn(async move {
            policy
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancel should interrupt the backoff sleep")
            .unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "no further attempts after cancel");
    }

    #[tokio::test]
    async fn test_resilience_error_not_retried() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::fixed(Duration::from_millis(10)))
            .with_sleeper(RecordingSleeper::new())
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), ResilienceError<TestError>>(ResilienceError::Timeout {
                        elapsed: Duration::from_secs(5),
                        timeout: Duration::from_secs(3),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should not retry non-Inner errors");
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_exponential_backoff_sequence() {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .expect("max_attempts > 0")
            .backoff(BackoffSchedule::exponential(Duration::from_millis(100)))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build();

        let _ = policy
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("fail".to_string())))
            })
            .await;

        assert_eq!(
            sleeper.slept(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }
}
