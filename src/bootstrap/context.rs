//! Composition root
//!
//! One `Context` owns the process-wide collaborators (config, health,
//! metrics, discovery, task pools, shutdown). Nothing in the crate reaches
//! for ambient globals; servers receive the context explicitly.

use crate::config::ConfigStore;
use crate::health::{HealthRegistry, MetricsRegistry};
use crate::registry::{GossipConfig, GossipRegistry, InMemoryRegistry, ServiceRegistry};
use crate::resilience::TaskPoolManager;
use crate::shutdown::{ShutdownController, ShutdownToken};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<ConfigStore>,
    pub health: Arc<HealthRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub tasks: Arc<TaskPoolManager>,
    pub shutdown: Arc<ShutdownController>,
}

impl Context {
    /// Build a context around `config`. The discovery backend is chosen by
    /// `discovery.distributed.enabled`.
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let registry: Arc<dyn ServiceRegistry> =
            if config.get_bool("discovery.distributed.enabled", false) {
                Arc::new(GossipRegistry::new(gossip_config_from(&config)))
            } else {
                Arc::new(InMemoryRegistry::new())
            };

        Self {
            config,
            health: Arc::new(HealthRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            registry,
            tasks: Arc::new(TaskPoolManager::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.token()
    }
}

fn gossip_config_from(config: &ConfigStore) -> GossipConfig {
    let group = config
        .get_string("discovery.gossip.group", "239.255.0.1")
        .parse::<Ipv4Addr>()
        .ok();

    let bootstrap_peers: Vec<SocketAddr> = config
        .get_string("discovery.gossip.bootstrap.peers", "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|addr| match addr.to_socket_addrs() {
            Ok(mut resolved) => resolved.next(),
            Err(e) => {
                tracing::warn!(addr, error = %e, "ignoring unresolvable gossip bootstrap peer");
                None
            }
        })
        .collect();

    // A bootstrap list implies unicast-only gossip
    let multicast_group = if bootstrap_peers.is_empty() { group } else { None };

    GossipConfig {
        bind_port: config.get_port("discovery.gossip.port", 8765),
        multicast_group,
        multicast_ttl: config.get_int("discovery.gossip.ttl", 4) as u32,
        bootstrap_peers,
        announce_interval: config
            .get_millis("discovery.gossip.interval.ms", Duration::from_secs(30)),
        expire_after: config.get_millis("discovery.gossip.expire.ms", Duration::from_secs(90)),
        min_announce_interval: Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_context_uses_in_memory_registry() {
        let context = Context::new(Arc::new(ConfigStore::new()));
        context
            .registry
            .register_service("tracker", "t1", "127.0.0.1", 6000, Default::default())
            .await
            .unwrap();
        assert_eq!(context.registry.discover_services("tracker").await.len(), 1);
    }

    #[test]
    fn gossip_config_reads_bootstrap_peers() {
        let config = ConfigStore::new();
        config.set("discovery.gossip.bootstrap.peers", "127.0.0.1:9001, 127.0.0.1:9002");
        config.set("discovery.gossip.port", "9000");

        let gossip = gossip_config_from(&config);
        assert_eq!(gossip.bind_port, 9000);
        assert_eq!(gossip.bootstrap_peers.len(), 2);
        assert!(gossip.multicast_group.is_none(), "bootstrap list implies unicast");
    }

    #[test]
    fn gossip_config_defaults_to_multicast() {
        let config = ConfigStore::new();
        let gossip = gossip_config_from(&config);
        assert_eq!(gossip.multicast_group, Some(Ipv4Addr::new(239, 255, 0, 1)));
        assert_eq!(gossip.bind_port, 8765);
        assert_eq!(gossip.announce_interval, Duration::from_secs(30));
        assert_eq!(gossip.expire_after, Duration::from_secs(90));
    }
}
