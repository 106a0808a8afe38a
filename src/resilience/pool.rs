//! Bounded async connection pool
//!
//! Capacity accounting uses a compare-and-set loop on the total-connection
//! counter; `in_use + idle <= max` holds at all times. Idle connections are
//! validated at acquisition and evicted when stale or broken. Acquired
//! connections are returned on drop, so every exit path releases.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no connection available within {waited:?} ({in_use} in use, max {max})")]
    AcquireTimeout { waited: Duration, in_use: usize, max: usize },
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("pool is closed")]
    Closed,
}

/// A connection the pool can validate before reuse.
#[async_trait]
pub trait ManagedConnection: Send {
    /// Cheap liveness probe run when an idle connection is handed out again.
    async fn is_valid(&mut self) -> bool;
}

/// Creates new connections on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: ManagedConnection + 'static;
    async fn connect(&self) -> Result<Self::Conn, PoolError>;
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    max: usize,
    idle_ttl: Duration,
    total: AtomicUsize,
    idle: Mutex<VecDeque<Idle<F::Conn>>>,
    returned: Notify,
    closed: AtomicBool,
}

pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, max: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                max: max.max(1),
                idle_ttl: Duration::from_secs(30),
                total: AtomicUsize::new(0),
                idle: Mutex::new(VecDeque::new()),
                returned: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_idle_ttl(self, idle_ttl: Duration) -> Self {
        // Arc not yet shared at construction time
        let mut inner = Arc::try_unwrap(self.inner).ok().expect("pool not yet shared");
        inner.idle_ttl = idle_ttl;
        Self { inner: Arc::new(inner) }
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// Connections currently created (in use + idle).
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn in_use(&self) -> usize {
        self.total().saturating_sub(self.idle_count())
    }

    /// Acquire a connection, waiting up to `wait` for capacity.
    pub async fn acquire(&self, wait: Duration) -> Result<PooledConn<F>, PoolError> {
        let deadline = Instant::now() + wait;

        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            // Reuse an idle connection if one validates
            loop {
                let candidate =
                    self.inner.idle.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
                let Some(mut idle) = candidate else { break };

                if idle.since.elapsed() > self.inner.idle_ttl || !idle.conn.is_valid().await {
                    tracing::debug!("evicting stale idle connection");
                    self.inner.total.fetch_sub(1, Ordering::AcqRel);
                    self.inner.returned.notify_one();
                    continue;
                }
                return Ok(PooledConn { conn: Some(idle.conn), pool: self.inner.clone(), discard: false });
            }

            // Below capacity? CAS-increment and create.
            let mut current = self.inner.total.load(Ordering::Acquire);
            let reserved = loop {
                if current >= self.inner.max {
                    break false;
                }
                match self.inner.total.compare_exchange(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break true,
                    Err(observed) => current = observed,
                }
            };

            if reserved {
                match self.inner.factory.connect().await {
                    Ok(conn) => {
                        return Ok(PooledConn {
                            conn: Some(conn),
                            pool: self.inner.clone(),
                            discard: false,
                        })
                    }
                    Err(e) => {
                        self.inner.total.fetch_sub(1, Ordering::AcqRel);
                        self.inner.returned.notify_one();
                        return Err(e);
                    }
                }
            }

            // At capacity: wait for a return or the deadline
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::AcquireTimeout {
                    waited: wait,
                    in_use: self.in_use(),
                    max: self.inner.max,
                });
            }
            let notified = self.inner.returned.notified();
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Err(PoolError::AcquireTimeout {
                    waited: wait,
                    in_use: self.in_use(),
                    max: self.inner.max,
                });
            }
        }
    }

    /// Close the pool: drop idle connections and reject further acquires.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> =
            self.inner.idle.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        self.inner.total.fetch_sub(drained.len(), Ordering::AcqRel);
        drop(drained);
        self.inner.returned.notify_waiters();
    }
}

/// RAII guard for an acquired connection; returns it to the pool on drop.
pub struct PooledConn<F: ConnectionFactory> {
    conn: Option<F::Conn>,
    pool: Arc<PoolInner<F>>,
    discard: bool,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConn<F>
where
    F::Conn: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").field("conn", &self.conn).field("discard", &self.discard).finish()
    }
}

impl<F: ConnectionFactory> PooledConn<F> {
    /// Mark the connection broken; it will be dropped instead of returned.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConn<F> {
    type Target = F::Conn;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConn<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConn<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        if self.discard || self.pool.closed.load(Ordering::Acquire) {
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push_back(Idle { conn, since: Instant::now() });
        }
        self.pool.returned.notify_one();
    }
}
