//! Health records, metrics, and HTTP introspection

mod http;
mod metrics;

pub use http::{health_router, serve_health};
pub use metrics::{MetricsRegistry, ResourceMetricsSnapshot};

use crate::resilience::{Clock, WallClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    #[serde(rename = "lastChecked")]
    pub last_checked_millis: u64,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

/// Per-process health registry. Aggregate status is UP iff every registered
/// service is UP.
pub struct HealthRegistry {
    services: RwLock<HashMap<String, HealthRecord>>,
    clock: Arc<dyn Clock>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()), clock: Arc::new(WallClock) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn set_status(&self, name: &str, status: HealthStatus) {
        self.set_status_with_details(name, status, HashMap::new());
    }

    pub fn set_status_with_details(
        &self,
        name: &str,
        status: HealthStatus,
        details: HashMap<String, String>,
    ) {
        let record =
            HealthRecord { status, last_checked_millis: self.clock.now_millis(), details };
        self.services.write().unwrap_or_else(|p| p.into_inner()).insert(name.to_string(), record);
    }

    pub fn remove(&self, name: &str) {
        self.services.write().unwrap_or_else(|p| p.into_inner()).remove(name);
    }

    pub fn record(&self, name: &str) -> Option<HealthRecord> {
        self.services.read().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    pub fn aggregate(&self) -> HealthStatus {
        let services = self.services.read().unwrap_or_else(|p| p.into_inner());
        if services.values().all(|r| r.status == HealthStatus::Up) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    }

    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.services.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The `{status, timestamp, services}` document served over HTTP.
    pub fn to_json(&self, include_details: bool) -> serde_json::Value {
        let services = self.snapshot();
        let mut by_name = serde_json::Map::new();
        for (name, record) in services {
            let mut entry = serde_json::Map::new();
            entry.insert("status".into(), serde_json::to_value(record.status).unwrap_or_default());
            entry.insert("lastChecked".into(), record.last_checked_millis.into());
            if include_details {
                entry.insert(
                    "details".into(),
                    serde_json::to_value(&record.details).unwrap_or_default(),
                );
            }
            by_name.insert(name, serde_json::Value::Object(entry));
        }

        serde_json::json!({
            "status": self.aggregate(),
            "timestamp": self.clock.now_millis(),
            "services": by_name,
        })
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
