//! In-process service registry

use crate::registry::{check_identity, RegistryError, ServiceInstance, ServiceRegistry};
use crate::resilience::{Clock, WallClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type TypeMap = HashMap<String, HashMap<String, ServiceInstance>>;

/// Two-level map type -> (id -> instance). Register is idempotent on
/// (type, id): re-registration updates the endpoint and stamps
/// `last_updated`.
pub struct InMemoryRegistry {
    services: RwLock<TypeMap>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()), clock: Arc::new(WallClock) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register_service(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> Result<(), RegistryError> {
        check_identity(service_type, service_id)?;
        if port == 0 {
            return Err(RegistryError::InvalidPort);
        }

        let mut instance = ServiceInstance::new(service_type, service_id, host, port);
        instance.metadata = metadata;
        instance.last_updated_millis = self.clock.now_millis();

        let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
        services
            .entry(service_type.to_string())
            .or_default()
            .insert(service_id.to_string(), instance);
        tracing::debug!(service_type, service_id, host, port, "service registered");
        Ok(())
    }

    async fn deregister_service(
        &self,
        service_type: &str,
        service_id: &str,
    ) -> Result<(), RegistryError> {
        check_identity(service_type, service_id)?;
        let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
        if let Some(by_id) = services.get_mut(service_type) {
            by_id.remove(service_id);
            if by_id.is_empty() {
                services.remove(service_type);
            }
        }
        Ok(())
    }

    async fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        let services = self.services.read().unwrap_or_else(|p| p.into_inner());
        services
            .get(service_type)
            .map(|by_id| by_id.values().filter(|i| i.healthy).cloned().collect())
            .unwrap_or_default()
    }

    async fn get_service(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        let services = self.services.read().unwrap_or_else(|p| p.into_inner());
        services.get(service_type).and_then(|by_id| by_id.get(service_id)).cloned()
    }

    async fn is_service_healthy(&self, service_type: &str, service_id: &str) -> bool {
        self.get_service(service_type, service_id).await.map(|i| i.healthy).unwrap_or(false)
    }

    async fn update_service_health(
        &self,
        service_type: &str,
        service_id: &str,
        healthy: bool,
    ) -> Result<(), RegistryError> {
        let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
        let instance = services
            .get_mut(service_type)
            .and_then(|by_id| by_id.get_mut(service_id))
            .ok_or_else(|| RegistryError::UnknownService {
                service_type: service_type.to_string(),
                service_id: service_id.to_string(),
            })?;
        instance.healthy = healthy;
        instance.last_updated_millis = self.clock.now_millis();
        Ok(())
    }

    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_discover_returns_instance() {
        let registry = InMemoryRegistry::new();
        registry
            .register_service("tracker", "t1", "127.0.0.1", 6000, HashMap::new())
            .await
            .unwrap();

        let found = registry.discover_services("tracker").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_id, "t1");
        assert_eq!(found[0].port, 6000);
    }

    #[tokio::test]
    async fn register_is_idempotent_and_updates_endpoint() {
        let registry = InMemoryRegistry::new();
        registry
            .register_service("tracker", "t1", "127.0.0.1", 6000, HashMap::new())
            .await
            .unwrap();
        registry
            .register_service("tracker", "t1", "10.0.0.9", 6100, HashMap::new())
            .await
            .unwrap();

        let found = registry.discover_services("tracker").await;
        assert_eq!(found.len(), 1, "same (type, id) must not duplicate");
        assert_eq!(found[0].host, "10.0.0.9");
        assert_eq!(found[0].port, 6100);
    }

    #[tokio::test]
    async fn deregister_removes_instance() {
        let registry = InMemoryRegistry::new();
        registry
            .register_service("tracker", "t1", "127.0.0.1", 6000, HashMap::new())
            .await
            .unwrap();
        registry.deregister_service("tracker", "t1").await.unwrap();

        assert!(registry.discover_services("tracker").await.is_empty());
        assert!(registry.get_service("tracker", "t1").await.is_none());

        // Idempotent
        registry.deregister_service("tracker", "t1").await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_instances_are_not_discovered() {
        let registry = InMemoryRegistry::new();
        registry
            .register_service("tracker", "t1", "127.0.0.1", 6000, HashMap::new())
            .await
            .unwrap();
        registry.update_service_health("tracker", "t1", false).await.unwrap();

        assert!(registry.discover_services("tracker").await.is_empty());
        assert!(!registry.is_service_healthy("tracker", "t1").await);

        // Still addressable directly
        assert!(registry.get_service("tracker", "t1").await.is_some());
    }

    #[tokio::test]
    async fn health_update_for_unknown_service_errors() {
        let registry = InMemoryRegistry::new();
        assert!(matches!(
            registry.update_service_health("tracker", "ghost", true).await,
            Err(RegistryError::UnknownService { .. })
        ));
    }

    #[tokio::test]
    async fn empty_identity_is_rejected() {
        let registry = InMemoryRegistry::new();
        assert!(matches!(
            registry.register_service("", "x", "h", 1, HashMap::new()).await,
            Err(RegistryError::EmptyIdentity)
        ));
        assert!(matches!(
            registry.register_service("t", "x", "h", 0, HashMap::new()).await,
            Err(RegistryError::InvalidPort)
        ));
    }
}
