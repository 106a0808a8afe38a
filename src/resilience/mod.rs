//! Resilience primitives: retry, circuit breaking, pooling, caching, and
//! bounded task pools. Everything here is runtime-agnostic policy code the
//! tracker, index server, and peers lean on.

mod cache;
mod circuit_breaker;
mod clock;
mod error;
mod jitter;
mod pool;
mod recovery;
mod retry;
mod tasks;

pub use cache::{CacheStatsSnapshot, TtlCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{epoch_millis, Clock, ManualClock, MonotonicClock, WallClock};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use pool::{ConnectionFactory, ConnectionPool, ManagedConnection, PoolError, PooledConn};
pub use recovery::{RecoveryManager, RecoveryStrategy};
pub use retry::{
    BackoffSchedule, BuildError, RetryPolicy, RetryPolicyBuilder, RetryStrategy, Sleeper,
    TimerSleeper, DEFAULT_MAX_BACKOFF,
};
pub use tasks::{TaskPool, TaskPoolError, TaskPoolManager, TaskPoolMetrics};
