//! Named bounded task pools with structured shutdown
//!
//! Each pool bounds both concurrency (semaphore permits) and queue depth
//! (CAS-guarded counter); overflow surfaces as an overload error rather than
//! unbounded memory growth. `shutdown_all` closes intake, waits out a grace
//! period, then aborts stragglers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum TaskPoolError {
    #[error("task pool '{pool}' overloaded ({queued} queued, limit {limit})")]
    Overloaded { pool: String, queued: usize, limit: usize },
    #[error("task pool '{0}' is shut down")]
    ShutDown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPoolMetrics {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
}

pub struct TaskPool {
    name: String,
    permits: Arc<Semaphore>,
    queue_limit: usize,
    closed: std::sync::atomic::AtomicBool,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    fn new(name: String, max_concurrent: usize, queue_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue_limit: queue_limit.max(1),
            closed: std::sync::atomic::AtomicBool::new(false),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> TaskPoolMetrics {
        TaskPoolMetrics {
            active: self.active.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Submit a task. Fails with `Overloaded` when the queue is full and with
    /// `ShutDown` after `shutdown_all`.
    pub fn spawn<F>(self: &Arc<Self>, fut: F) -> Result<(), TaskPoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskPoolError::ShutDown(self.name.clone()));
        }

        // increment-if-below-limit on the queue depth
        let mut current = self.queued.load(Ordering::Acquire);
        loop {
            if current >= self.queue_limit {
                return Err(TaskPoolError::Overloaded {
                    pool: self.name.clone(),
                    queued: current,
                    limit: self.queue_limit,
                });
            }
            match self.queued.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let permit = match pool.permits.acquire().await {
                Ok(permit) => permit,
                Err(_closed) => {
                    pool.queued.fetch_sub(1, Ordering::AcqRel);
                    pool.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            pool.queued.fetch_sub(1, Ordering::AcqRel);
            pool.active.fetch_add(1, Ordering::AcqRel);

            fut.await;

            pool.active.fetch_sub(1, Ordering::AcqRel);
            pool.completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Refuse new submissions; queued tasks still drain.
    fn close_intake(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Owns every named pool in a process; part of the composition root.
#[derive(Default)]
pub struct TaskPoolManager {
    pools: RwLock<HashMap<String, Arc<TaskPool>>>,
}

impl TaskPoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a pool. Existing pools keep their original limits.
    pub fn pool(
        &self,
        name: &str,
        max_concurrent: usize,
        queue_limit: usize,
    ) -> Arc<TaskPool> {
        if let Some(pool) = self.pools.read().unwrap_or_else(|p| p.into_inner()).get(name) {
            return pool.clone();
        }
        let mut pools = self.pools.write().unwrap_or_else(|p| p.into_inner());
        pools
            .entry(name.to_string())
            .or_insert_with(|| TaskPool::new(name.to_string(), max_concurrent, queue_limit))
            .clone()
    }

    /// A single-worker pool for strictly serial work.
    pub fn single(&self, name: &str, queue_limit: usize) -> Arc<TaskPool> {
        self.pool(name, 1, queue_limit)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskPool>> {
        self.pools.read().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    pub fn metrics(&self) -> HashMap<String, TaskPoolMetrics> {
        self.pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(name, pool)| (name.clone(), pool.metrics()))
            .collect()
    }

    /// Close all pools, wait up to `grace` for in-flight work, abort the rest.
    pub async fn shutdown_all(&self, grace: Duration) {
        let pools: Vec<Arc<TaskPool>> = {
            self.pools.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
        };
        for pool in &pools {
            pool.close_intake();
        }

        let deadline = Instant::now() + grace;
        for pool in &pools {
            for mut handle in pool.take_handles() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let outcome = tokio::time::timeout(remaining, &mut handle).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(_join_err)) => {
                        pool.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_elapsed) => {
                        handle.abort();
                        pool.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(pool = %pool.name, "aborted task at shutdown deadline");
                    }
                }
            }
        }
    }
}
