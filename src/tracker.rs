//! Tracker: the registry of currently-live peers
//!
//! Peers register, refresh themselves with heartbeats, and are swept out
//! once `peer_timeout` passes without a refresh. Discovery returns only
//! peers seen within the timeout window.

use crate::config::ConfigStore;
use crate::health::{HealthRegistry, HealthStatus, MetricsRegistry};
use crate::protocol::{
    serve, Dispatcher, Envelope, ErrorCode, HandlerError, Message, MessageContext, MessageHandler,
    PeerInfo,
};
use crate::registry::ServiceRegistry;
use crate::resilience::{Clock, WallClock};
use crate::shutdown::ShutdownToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SERVICE_TYPE: &str = "tracker";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub port: u16,
    pub host: String,
    pub peer_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_connections: usize,
}

impl TrackerConfig {
    pub fn from_config(config: &ConfigStore) -> Self {
        Self {
            port: config.get_port("tracker.port", 6000),
            host: config.get_string("tracker.host", "127.0.0.1"),
            peer_timeout: config
                .get_millis("tracker.peer.timeout.ms", Duration::from_millis(90_000)),
            cleanup_interval: config
                .get_millis("tracker.cleanup.interval.ms", Duration::from_millis(60_000)),
            max_connections: config.get_int("tracker.thread.pool.size", 10).max(1) as usize,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            port: 6000,
            host: "127.0.0.1".to_string(),
            peer_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
            max_connections: 10,
        }
    }
}

struct TrackerState {
    peers: RwLock<HashMap<String, PeerInfo>>,
    peer_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl TrackerState {
    fn register(&self, peer_id: &str, host: &str, port: u16) {
        let now = self.clock.now_millis();
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        peers.insert(
            peer_id.to_string(),
            PeerInfo {
                peer_id: peer_id.to_string(),
                host: host.to_string(),
                port,
                last_seen_millis: now,
            },
        );
    }

    fn deregister(&self, peer_id: &str) -> bool {
        self.peers.write().unwrap_or_else(|p| p.into_inner()).remove(peer_id).is_some()
    }

    /// Refresh `last_seen`; refreshes older than the stored value are ignored.
    fn refresh(&self, peer_id: &str) -> bool {
        let now = self.clock.now_millis();
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        match peers.get_mut(peer_id) {
            Some(peer) => {
                if now > peer.last_seen_millis {
                    peer.last_seen_millis = now;
                }
                true
            }
            None => false,
        }
    }

    fn is_live(&self, peer: &PeerInfo, now: u64) -> bool {
        now.saturating_sub(peer.last_seen_millis) <= self.peer_timeout.as_millis() as u64
    }

    fn live_peers(&self) -> Vec<PeerInfo> {
        let now = self.clock.now_millis();
        let peers = self.peers.read().unwrap_or_else(|p| p.into_inner());
        peers.values().filter(|p| self.is_live(p, now)).cloned().collect()
    }

    fn is_alive(&self, peer_id: &str) -> bool {
        let now = self.clock.now_millis();
        let peers = self.peers.read().unwrap_or_else(|p| p.into_inner());
        peers.get(peer_id).map(|p| self.is_live(p, now)).unwrap_or(false)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        let before = peers.len();
        peers.retain(|_, peer| self.is_live(peer, now));
        before - peers.len()
    }

    fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

struct TrackerHandler {
    state: Arc<TrackerState>,
    metrics: Arc<MetricsRegistry>,
}

#[async_trait]
impl MessageHandler for TrackerHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        _ctx: &MessageContext,
    ) -> Result<Option<Message>, HandlerError> {
        match &envelope.message {
            Message::RegisterRequest { peer_id, host, port } => {
                self.state.register(peer_id, host, *port);
                self.metrics.increment(SERVICE_TYPE, "register");
                tracing::info!(peer_id, host, port, "peer registered");
                Ok(Some(Message::RegisterResponse { success: true, message: None }))
            }
            Message::DeregisterRequest { peer_id } => {
                let removed = self.state.deregister(peer_id);
                self.metrics.increment(SERVICE_TYPE, "deregister");
                tracing::info!(peer_id, removed, "peer deregistered");
                Ok(Some(Message::DeregisterResponse { success: true }))
            }
            Message::DiscoverRequest => {
                self.metrics.increment(SERVICE_TYPE, "discover");
                Ok(Some(Message::DiscoverResponse { peers: self.state.live_peers() }))
            }
            Message::IsAliveRequest { peer_id } => {
                Ok(Some(Message::IsAliveResponse { alive: self.state.is_alive(peer_id) }))
            }
            Message::Heartbeat { peer_id } => {
                if !self.state.refresh(peer_id) {
                    tracing::debug!(peer_id, "heartbeat from unknown peer");
                }
                self.metrics.increment(SERVICE_TYPE, "heartbeat");
                Ok(None)
            }
            Message::Ping => Ok(Some(Message::Pong)),
            other => Err(HandlerError::new(
                ErrorCode::UnknownCommand,
                format!("tracker does not handle '{}'", other.kind()),
            )),
        }
    }
}

pub struct TrackerServer {
    config: TrackerConfig,
    state: Arc<TrackerState>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthRegistry>,
    metrics: Arc<MetricsRegistry>,
    registry: Arc<dyn ServiceRegistry>,
    service_id: String,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl TrackerServer {
    pub fn new(
        config: TrackerConfig,
        health: Arc<HealthRegistry>,
        metrics: Arc<MetricsRegistry>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Arc<Self> {
        let state = Arc::new(TrackerState {
            peers: RwLock::new(HashMap::new()),
            peer_timeout: config.peer_timeout,
            clock: Arc::new(WallClock),
        });

        let dispatcher = Arc::new(Dispatcher::new(SERVICE_TYPE));
        let handler = Arc::new(TrackerHandler { state: state.clone(), metrics: metrics.clone() });
        for kind in [
            "register_request",
            "deregister_request",
            "discover_request",
            "is_alive_request",
            "heartbeat",
            "ping",
        ] {
            dispatcher.register_handler(kind, 0, handler.clone());
        }

        Arc::new(Self {
            config,
            state,
            dispatcher,
            health,
            metrics,
            registry,
            service_id: format!("{SERVICE_TYPE}-1"),
            local_addr: RwLock::new(None),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn peer_count(&self) -> usize {
        self.state.len()
    }

    /// Bind, announce to the service registry, and run until shutdown.
    pub async fn start(self: &Arc<Self>, shutdown: ShutdownToken) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().unwrap_or_else(|p| p.into_inner()) = Some(addr);

        tokio::spawn(serve(
            listener,
            self.dispatcher.clone(),
            self.config.max_connections,
            shutdown.clone(),
        ));

        // Liveness sweep
        let server = self.clone();
        let sweep_token = shutdown.clone();
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = server.state.sweep();
                        if removed > 0 {
                            tracing::info!(removed, "swept expired peers");
                            server.metrics.increment_by(SERVICE_TYPE, "swept", removed as u64);
                        }
                        server.publish_health();
                    }
                    _ = sweep_token.cancelled() => break,
                }
            }
        });

        if let Err(e) = self
            .registry
            .register_service(
                SERVICE_TYPE,
                &self.service_id,
                &self.config.host,
                addr.port(),
                HashMap::new(),
            )
            .await
        {
            tracing::warn!(error = %e, "tracker could not announce itself");
        }
        self.publish_health();

        tracing::info!(%addr, "tracker listening");
        Ok(addr)
    }

    fn publish_health(&self) {
        let mut details = HashMap::new();
        details.insert("peers".to_string(), self.state.len().to_string());
        self.health.set_status_with_details(SERVICE_TYPE, HealthStatus::Up, details);
    }

    /// Deregister from discovery and mark DOWN. The accept loop stops via
    /// the shutdown token passed to `start`.
    pub async fn stop(&self) {
        let _ = self.registry.deregister_service(SERVICE_TYPE, &self.service_id).await;
        self.health.set_status(SERVICE_TYPE, HealthStatus::Down);
        tracing::info!("tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::resilience::ManualClock;
    use crate::shutdown::ShutdownController;

    fn state_with_clock(timeout_millis: u64) -> (TrackerState, ManualClock) {
        let clock = ManualClock::new();
        let state = TrackerState {
            peers: RwLock::new(HashMap::new()),
            peer_timeout: Duration::from_millis(timeout_millis),
            clock: Arc::new(clock.clone()),
        };
        (state, clock)
    }

    #[test]
    fn registered_peer_is_live_until_timeout() {
        let (state, clock) = state_with_clock(100);
        state.register("p1", "h", 8080);

        assert!(state.is_alive("p1"));
        assert_eq!(state.live_peers().len(), 1);

        clock.advance(150);
        assert!(!state.is_alive("p1"));
        assert!(state.live_peers().is_empty());
    }

    #[test]
    fn heartbeat_extends_liveness() {
        let (state, clock) = state_with_clock(100);
        state.register("p1", "h", 8080);

        clock.advance(80);
        assert!(state.refresh("p1"));
        clock.advance(80);
        assert!(state.is_alive("p1"), "refresh must reset the window");
    }

    #[test]
    fn refresh_unknown_peer_is_reported() {
        let (state, _clock) = state_with_clock(100);
        assert!(!state.refresh("ghost"));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (state, clock) = state_with_clock(100);
        state.register("old", "h", 8080);
        clock.advance(150);
        state.register("new", "h", 8081);

        assert_eq!(state.sweep(), 1);
        assert_eq!(state.len(), 1);
        assert!(state.is_alive("new"));
    }

    #[test]
    fn deregister_is_idempotent() {
        let (state, _clock) = state_with_clock(100);
        state.register("p1", "h", 8080);
        assert!(state.deregister("p1"));
        assert!(!state.deregister("p1"));
    }

    #[tokio::test]
    async fn tracker_announces_itself_on_start() {
        let registry = Arc::new(InMemoryRegistry::new());
        let tracker = TrackerServer::new(
            TrackerConfig { port: 0, ..Default::default() },
            Arc::new(HealthRegistry::new()),
            Arc::new(MetricsRegistry::new()),
            registry.clone(),
        );

        let ctrl = ShutdownController::new();
        let addr = tracker.start(ctrl.token()).await.unwrap();
        assert!(addr.port() > 0);

        let found = registry.discover_services(SERVICE_TYPE).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, addr.port());

        tracker.stop().await;
        assert!(registry.discover_services(SERVICE_TYPE).await.is_empty());
        ctrl.shutdown();
    }
}
