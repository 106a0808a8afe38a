//! Atomic per-resource metrics

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct ResourceMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    total_time_millis: AtomicU64,
    min_time_millis: AtomicU64,
    max_time_millis: AtomicU64,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

/// Point-in-time view of one resource's metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_time_millis: f64,
    pub min_time_millis: u64,
    pub max_time_millis: u64,
    pub counters: HashMap<String, u64>,
}

impl ResourceMetrics {
    fn record(&self, elapsed: Duration, ok: bool) {
        let millis = elapsed.as_millis() as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_time_millis.fetch_add(millis, Ordering::Relaxed);
        self.min_time_millis.fetch_min(millis, Ordering::Relaxed);
        self.max_time_millis.fetch_max(millis, Ordering::Relaxed);
    }

    fn increment(&self, counter: &str, by: u64) {
        {
            let counters = self.counters.read().unwrap_or_else(|p| p.into_inner());
            if let Some(value) = counters.get(counter) {
                value.fetch_add(by, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|p| p.into_inner());
        counters
            .entry(counter.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ResourceMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total = self.total_time_millis.load(Ordering::Relaxed);
        let min = self.min_time_millis.load(Ordering::Relaxed);
        ResourceMetricsSnapshot {
            requests,
            errors,
            error_rate: if requests == 0 { 0.0 } else { errors as f64 / requests as f64 },
            avg_time_millis: if requests == 0 { 0.0 } else { total as f64 / requests as f64 },
            min_time_millis: if min == u64::MAX { 0 } else { min },
            max_time_millis: self.max_time_millis.load(Ordering::Relaxed),
            counters: self
                .counters
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .map(|(name, value)| (name.clone(), value.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Metrics keyed by resource name; all updates are atomic increments.
#[derive(Default)]
pub struct MetricsRegistry {
    resources: RwLock<HashMap<String, Arc<ResourceMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn resource(&self, name: &str) -> Arc<ResourceMetrics> {
        if let Some(metrics) = self.resources.read().unwrap_or_else(|p| p.into_inner()).get(name) {
            return metrics.clone();
        }
        let mut resources = self.resources.write().unwrap_or_else(|p| p.into_inner());
        resources
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ResourceMetrics {
                    min_time_millis: AtomicU64::new(u64::MAX),
                    ..Default::default()
                })
            })
            .clone()
    }

    pub fn record_request(&self, name: &str, elapsed: Duration, ok: bool) {
        self.resource(name).record(elapsed, ok);
    }

    pub fn increment(&self, name: &str, counter: &str) {
        self.resource(name).increment(counter, 1);
    }

    pub fn increment_by(&self, name: &str, counter: &str, by: u64) {
        self.resource(name).increment(counter, by);
    }

    pub fn snapshot(&self, name: &str) -> Option<ResourceMetricsSnapshot> {
        self.resources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|m| m.snapshot())
    }

    pub fn snapshot_all(&self) -> HashMap<String, ResourceMetricsSnapshot> {
        self.resources
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
            .collect()
    }
}
