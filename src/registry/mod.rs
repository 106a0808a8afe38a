//! Service discovery: a registry abstraction with an in-process
//! implementation and a gossip-based distributed one, plus a locator for
//! picking an instance out of a discovery result.

mod gossip;
mod local;

pub use gossip::{GossipConfig, GossipRegistry};
pub use local::InMemoryRegistry;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One registered endpoint of a service type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_type: String,
    pub service_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub healthy: bool,
    pub last_updated_millis: u64,
}

impl ServiceInstance {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
            healthy: true,
            last_updated_millis: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service type and id must not be empty")]
    EmptyIdentity,
    #[error("port must be in [1, 65535]")]
    InvalidPort,
    #[error("unknown service ({service_type}, {service_id})")]
    UnknownService { service_type: String, service_id: String },
    #[error("registry transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("registry is not running")]
    NotRunning,
}

/// Directory of (type, id) -> endpoint entries used by every role.
///
/// `discover_services` returns only instances that are currently healthy and
/// not expired, in unspecified order; pick with a [`ServiceLocator`].
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register_service(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> Result<(), RegistryError>;

    async fn deregister_service(
        &self,
        service_type: &str,
        service_id: &str,
    ) -> Result<(), RegistryError>;

    async fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance>;

    async fn get_service(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance>;

    async fn is_service_healthy(&self, service_type: &str, service_id: &str) -> bool;

    async fn update_service_health(
        &self,
        service_type: &str,
        service_id: &str,
        healthy: bool,
    ) -> Result<(), RegistryError>;

    async fn start(&self) -> Result<(), RegistryError>;

    async fn stop(&self);
}

pub(crate) fn check_identity(service_type: &str, service_id: &str) -> Result<(), RegistryError> {
    if service_type.trim().is_empty() || service_id.trim().is_empty() {
        return Err(RegistryError::EmptyIdentity);
    }
    Ok(())
}

/// Instance selection policy over a discovery result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Random,
    RoundRobin,
}

/// Picks one instance from a discovery result.
pub struct ServiceLocator {
    policy: SelectionPolicy,
    cursor: AtomicUsize,
}

impl ServiceLocator {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy, cursor: AtomicUsize::new(0) }
    }

    pub fn random() -> Self {
        Self::new(SelectionPolicy::Random)
    }

    pub fn round_robin() -> Self {
        Self::new(SelectionPolicy::RoundRobin)
    }

    pub fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = match self.policy {
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..instances.len()),
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len()
            }
        };
        instances.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new("tracker", format!("t{i}"), "127.0.0.1", 6000 + i as u16))
            .collect()
    }

    #[test]
    fn locator_returns_none_for_empty() {
        assert!(ServiceLocator::random().select(&[]).is_none());
        assert!(ServiceLocator::round_robin().select(&[]).is_none());
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let locator = ServiceLocator::round_robin();
        let pool = instances(3);

        let picks: Vec<_> =
            (0..6).map(|_| locator.select(&pool).unwrap().service_id.clone()).collect();
        assert_eq!(picks, vec!["t0", "t1", "t2", "t0", "t1", "t2"]);
    }

    #[test]
    fn random_always_picks_a_member() {
        let locator = ServiceLocator::random();
        let pool = instances(4);
        for _ in 0..50 {
            let pick = locator.select(&pool).unwrap();
            assert!(pool.contains(pick));
        }
    }
}
