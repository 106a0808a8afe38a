//! Gossip-based distributed service registry
//!
//! Membership spreads over UDP: multicast on a fixed group, or unicast to a
//! configured bootstrap list. Records are single-datagram `|`-delimited
//! lines. Delivery is best-effort; correctness comes from periodic
//! re-announcement plus last-writer-wins on the source timestamp. Remote
//! entries expire when they stop being renewed; local entries never expire.

use crate::registry::{check_identity, RegistryError, ServiceInstance, ServiceRegistry};
use crate::resilience::{Clock, WallClock};
use crate::shutdown::ShutdownController;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// UDP bind port; 0 picks an ephemeral port (useful in tests).
    pub bind_port: u16,
    /// Multicast group to join and announce to; `None` disables multicast.
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Unicast fallback/bootstrap targets.
    pub bootstrap_peers: Vec<SocketAddr>,
    pub announce_interval: Duration,
    pub expire_after: Duration,
    /// Floor between announcements of the same (type, id).
    pub min_announce_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_port: 8765,
            multicast_group: Some(Ipv4Addr::new(239, 255, 0, 1)),
            multicast_ttl: 4,
            bootstrap_peers: Vec::new(),
            announce_interval: Duration::from_secs(30),
            expire_after: Duration::from_secs(90),
            min_announce_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Announce,
    Deregister,
    Health,
}

impl Verb {
    fn as_str(&self) -> &'static str {
        match self {
            Verb::Announce => "ANNOUNCE",
            Verb::Deregister => "DEREGISTER",
            Verb::Health => "HEALTH",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ANNOUNCE" => Some(Verb::Announce),
            "DEREGISTER" => Some(Verb::Deregister),
            "HEALTH" => Some(Verb::Health),
            _ => None,
        }
    }
}

struct Cached {
    instance: ServiceInstance,
    local: bool,
}

struct GossipState {
    cache: RwLock<HashMap<(String, String), Cached>>,
    last_announced: Mutex<HashMap<(String, String), u64>>,
}

pub struct GossipRegistry {
    config: GossipConfig,
    clock: Arc<dyn Clock>,
    state: Arc<GossipState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: Mutex<Option<ShutdownController>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipRegistry {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            clock: Arc::new(WallClock),
            state: Arc::new(GossipState {
                cache: RwLock::new(HashMap::new()),
                last_announced: Mutex::new(HashMap::new()),
            }),
            socket: Mutex::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The bound gossip address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn expired(&self, entry: &Cached, now: u64) -> bool {
        !entry.local
            && now.saturating_sub(entry.instance.last_updated_millis)
                > self.config.expire_after.as_millis() as u64
    }

    /// Apply one received record to the cache.
    fn apply(state: &GossipState, record_verb: Verb, incoming: ServiceInstance) {
        let key = (incoming.service_type.clone(), incoming.service_id.clone());
        let mut cache = state.cache.write().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = cache.get(&key) {
            if existing.local {
                // Originator == self; our own state is authoritative
                return;
            }
            if record_verb != Verb::Deregister
                && existing.instance.last_updated_millis >= incoming.last_updated_millis
            {
                // Last-writer-wins by source timestamp; equal is a no-op
                return;
            }
        }

        match record_verb {
            Verb::Announce | Verb::Health => {
                tracing::debug!(
                    service_type = %incoming.service_type,
                    service_id = %incoming.service_id,
                    healthy = incoming.healthy,
                    "gossip applied"
                );
                cache.insert(key, Cached { instance: incoming, local: false });
            }
            Verb::Deregister => {
                cache.remove(&key);
            }
        }
    }

    async fn send_record(&self, verb: Verb, instance: &ServiceInstance, force: bool) {
        let socket = {
            self.socket.lock().unwrap_or_else(|p| p.into_inner()).clone()
        };
        let Some(socket) = socket else { return };

        if !force && !self.may_announce(instance) {
            return;
        }

        let line = encode_record(verb, instance);
        if line.len() > MAX_DATAGRAM {
            tracing::warn!(
                service_id = %instance.service_id,
                size = line.len(),
                "gossip record exceeds datagram budget, skipping"
            );
            return;
        }

        let mut targets: Vec<SocketAddr> = self.config.bootstrap_peers.clone();
        if let Some(group) = self.config.multicast_group {
            targets.push(SocketAddr::from((group, self.config.bind_port)));
        }
        for target in targets {
            if let Err(e) = socket.send_to(line.as_bytes(), target).await {
                tracing::debug!(%target, error = %e, "gossip send failed");
            }
        }
    }

    /// Rate limit: at most one announcement per (type, id) per interval.
    fn may_announce(&self, instance: &ServiceInstance) -> bool {
        let key = (instance.service_type.clone(), instance.service_id.clone());
        let now = self.now();
        let min = self.config.min_announce_interval.as_millis() as u64;
        let mut last = self.state.last_announced.lock().unwrap_or_else(|p| p.into_inner());
        match last.get(&key) {
            Some(at) if now.saturating_sub(*at) < min => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    fn local_instances(&self) -> Vec<ServiceInstance> {
        self.state
            .cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|c| c.local)
            .map(|c| c.instance.clone())
            .collect()
    }

    async fn announce_all_local(&self) {
        for instance in self.local_instances() {
            self.send_record(Verb::Announce, &instance, false).await;
        }
    }
}

fn encode_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(',', "%2C").replace('=', "%3D").replace('|', "%7C")
}

fn decode_component(encoded: &str) -> String {
    encoded.replace("%7C", "|").replace("%3D", "=").replace("%2C", ",").replace("%25", "%")
}

fn encode_metadata(metadata: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = metadata.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_metadata(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    raw.split(',')
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (decode_component(k), decode_component(v)))
        })
        .collect()
}

fn encode_record(verb: Verb, instance: &ServiceInstance) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        verb.as_str(),
        encode_component(&instance.service_type),
        encode_component(&instance.service_id),
        encode_component(&instance.host),
        instance.port,
        instance.healthy,
        instance.last_updated_millis,
        encode_metadata(&instance.metadata),
    )
}

fn parse_record(line: &str) -> Option<(Verb, ServiceInstance)> {
    let mut parts = line.trim_end().splitn(8, '|');
    let verb = Verb::parse(parts.next()?)?;
    let service_type = decode_component(parts.next()?);
    let service_id = decode_component(parts.next()?);
    let host = decode_component(parts.next()?);
    let port: u16 = parts.next()?.parse().ok()?;
    let healthy: bool = parts.next()?.parse().ok()?;
    let last_updated_millis: u64 = parts.next()?.parse().ok()?;
    let metadata = decode_metadata(parts.next().unwrap_or(""));

    if service_type.is_empty() || service_id.is_empty() || port == 0 {
        return None;
    }

    let mut instance = ServiceInstance::new(service_type, service_id, host, port);
    instance.healthy = healthy;
    instance.last_updated_millis = last_updated_millis;
    instance.metadata = metadata;
    Some((verb, instance))
}

#[async_trait]
impl ServiceRegistry for GossipRegistry {
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
        instance.last_updated_millis = self.now();

        let key = (service_type.to_string(), service_id.to_string());
        self.state
            .cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, Cached { instance: instance.clone(), local: true });

        self.send_record(Verb::Announce, &instance, false).await;
        Ok(())
    }

    async fn deregister_service(
        &self,
        service_type: &str,
        service_id: &str,
    ) -> Result<(), RegistryError> {
        check_identity(service_type, service_id)?;
        let key = (service_type.to_string(), service_id.to_string());
        let removed = self
            .state
            .cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key)
            .map(|c| c.instance);

        if let Some(mut instance) = removed {
            instance.last_updated_millis = self.now();
            // Deregistration bypasses the announce rate limit
            self.send_record(Verb::Deregister, &instance, true).await;
        }
        Ok(())
    }

    async fn discover_services(&self, service_type: &str) -> Vec<ServiceInstance> {
        let now = self.now();

        // Evict expired remote entries on lookup
        let mut expired_keys = Vec::new();
        {
            let cache = self.state.cache.read().unwrap_or_else(|p| p.into_inner());
            for (key, entry) in cache.iter() {
                if key.0 == service_type && self.expired(entry, now) {
                    expired_keys.push(key.clone());
                }
            }
        }
        if !expired_keys.is_empty() {
            let mut cache = self.state.cache.write().unwrap_or_else(|p| p.into_inner());
            for key in expired_keys {
                if cache.get(&key).map(|e| self.expired(e, now)).unwrap_or(false) {
                    tracing::debug!(service_id = %key.1, "expired gossip entry evicted");
                    cache.remove(&key);
                }
            }
        }

        let cache = self.state.cache.read().unwrap_or_else(|p| p.into_inner());
        cache
            .iter()
            .filter(|((t, _), entry)| {
                t == service_type && entry.instance.healthy && !self.expired(entry, now)
            })
            .map(|(_, entry)| entry.instance.clone())
            .collect()
    }

    async fn get_service(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        let now = self.now();
        let key = (service_type.to_string(), service_id.to_string());
        let cache = self.state.cache.read().unwrap_or_else(|p| p.into_inner());
        cache.get(&key).filter(|entry| !self.expired(entry, now)).map(|e| e.instance.clone())
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
        let key = (service_type.to_string(), service_id.to_string());
        let updated = {
            let mut cache = self.state.cache.write().unwrap_or_else(|p| p.into_inner());
            let entry = cache.get_mut(&key).ok_or_else(|| RegistryError::UnknownService {
                service_type: service_type.to_string(),
                service_id: service_id.to_string(),
            })?;
            entry.instance.healthy = healthy;
            entry.instance.last_updated_millis = self.now();
            entry.local.then(|| entry.instance.clone())
        };

        // Local health changes are pushed out immediately
        if let Some(instance) = updated {
            self.send_record(Verb::Health, &instance, false).await;
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), RegistryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.bind_port)).await?;
        if let Some(group) = self.config.multicast_group {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
            socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
            socket.set_multicast_loop_v4(true)?;
        }
        let socket = Arc::new(socket);
        *self.socket.lock().unwrap_or_else(|p| p.into_inner()) = Some(socket.clone());

        let controller = ShutdownController::new();
        let token = controller.token();
        *self.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = Some(controller);

        // Receive loop: parse failures are logged and skipped
        let state = self.state.clone();
        let recv_socket = socket.clone();
        let recv_token = token.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = recv_socket.recv_from(&mut buf) => {
                        match received {
                            Ok((n, from)) => {
                                let raw = String::from_utf8_lossy(&buf[..n]);
                                match parse_record(&raw) {
                                    Some((verb, instance)) => {
                                        GossipRegistry::apply(&state, verb, instance)
                                    }
                                    None => {
                                        tracing::warn!(%from, "unparseable gossip datagram skipped")
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "gossip receive error");
                            }
                        }
                    }
                    _ = recv_token.cancelled() => break,
                }
            }
        });

        // Periodic announcement of everything we own
        let announcer = GossipAnnouncer {
            config: self.config.clone(),
            clock: self.clock.clone(),
            state: self.state.clone(),
            socket,
        };
        let announce_token = token;
        let interval = self.config.announce_interval;
        let announce_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => announcer.announce_local().await,
                    _ = announce_token.cancelled() => break,
                }
            }
        });

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.push(recv_task);
            tasks.push(announce_task);
        }

        tracing::info!(
            port = self.local_addr().map(|a| a.port()).unwrap_or(0),
            multicast = ?self.config.multicast_group,
            peers = self.config.bootstrap_peers.len(),
            "gossip registry started"
        );

        // First announcement without waiting for the ticker
        self.announce_all_local().await;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(controller) = self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).take() {
            controller.shutdown();
        }
        let tasks: Vec<_> = {
            self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect()
        };
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
        *self.socket.lock().unwrap_or_else(|p| p.into_inner()) = None;
        tracing::info!("gossip registry stopped");
    }
}

/// Announce-loop half, detached from `&self` so the task owns its state.
struct GossipAnnouncer {
    config: GossipConfig,
    clock: Arc<dyn Clock>,
    state: Arc<GossipState>,
    socket: Arc<UdpSocket>,
}

impl GossipAnnouncer {
    async fn announce_local(&self) {
        let locals: Vec<ServiceInstance> = {
            let mut cache = self.state.cache.write().unwrap_or_else(|p| p.into_inner());
            let now = self.clock.now_millis();
            cache
                .values_mut()
                .filter(|c| c.local)
                .map(|c| {
                    // Re-announcement refreshes the source timestamp
                    c.instance.last_updated_millis = now;
                    c.instance.clone()
                })
                .collect()
        };

        for instance in locals {
            let line = encode_record(Verb::Announce, &instance);
            let mut targets: Vec<SocketAddr> = self.config.bootstrap_peers.clone();
            if let Some(group) = self.config.multicast_group {
                targets.push(SocketAddr::from((group, self.config.bind_port)));
            }
            for target in targets {
                if let Err(e) = self.socket.send_to(line.as_bytes(), target).await {
                    tracing::debug!(%target, error = %e, "gossip announce failed");
                }
            }
        }
    }
}
