//! Bootstrap orchestration: dependency-ordered startup and shutdown
//!
//! Services register by name with async start/stop callables and optional
//! dependencies. Startup follows the topological order of the dependency
//! graph (registration order breaks ties); a failure rolls already-started
//! services back in reverse. Shutdown runs the reverse of the successful
//! start order exactly once.

mod context;
mod graph;

pub use context::Context;
pub use graph::{format_cycle, DependencyGraph};

use crate::config::ConfigStore;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

pub type ServiceResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;
type ServiceFn = Box<dyn FnMut() -> ServiceFuture + Send>;

/// Lifecycle states of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registered,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

/// Service roles with a well-known base port, used by dynamic-port mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Tracker,
    IndexServer,
    Peer,
}

impl ServiceKind {
    fn port_key(&self) -> &'static str {
        match self {
            ServiceKind::Tracker => "tracker.port",
            ServiceKind::IndexServer => "indexserver.port",
            ServiceKind::Peer => "peer.port",
        }
    }

    fn base_port(&self, config: &ConfigStore) -> u16 {
        match self {
            ServiceKind::Tracker => config.get_port("tracker.port", 6000),
            ServiceKind::IndexServer => config.get_port("indexserver.port", 6001),
            ServiceKind::Peer => config.get_port("peer.port.base", 7000),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("service '{0}' is already registered")]
    DuplicateService(String),
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("circular dependencies detected: {}", .cycles.iter().map(|c| format_cycle(c)).collect::<Vec<_>>().join("; "))]
    CircularDependency { cycles: Vec<Vec<String>> },
    #[error("service '{service}' failed to start: {message}")]
    StartupFailed { service: String, message: String },
    #[error("service '{service}' did not start within {timeout:?}")]
    StartupTimeout { service: String, timeout: Duration },
    #[error("dynamic port allocation failed for '{service}': {message}")]
    PortAllocation { service: String, message: String },
}

impl BootstrapError {
    /// Cycles formatted as `A -> B -> C -> A`, when this is a cycle failure.
    pub fn formatted_cycles(&self) -> Vec<String> {
        match self {
            BootstrapError::CircularDependency { cycles } => {
                cycles.iter().map(|c| format_cycle(c)).collect()
            }
            _ => Vec::new(),
        }
    }
}

struct ServiceRecord {
    name: String,
    kind: Option<ServiceKind>,
    start: ServiceFn,
    stop: ServiceFn,
    state: ServiceState,
    last_error: Option<String>,
}

/// The orchestrator. Owned by the composition root; not shared.
pub struct Bootstrap {
    services: Vec<ServiceRecord>,
    index: HashMap<String, usize>,
    graph: DependencyGraph,
    start_timeout: Duration,
    stop_timeout: Duration,
    dynamic_ports: Option<Arc<ConfigStore>>,
    started: Vec<usize>,
    shutdown_done: bool,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            graph: DependencyGraph::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_START_TIMEOUT,
            dynamic_ports: None,
            started: Vec::new(),
            shutdown_done: false,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Enable dynamic-port mode: before starting a typed service, probe for a
    /// free port from its base and publish it under the service's port key.
    pub fn with_dynamic_ports(mut self, config: Arc<ConfigStore>) -> Self {
        self.dynamic_ports = Some(config);
        self
    }

    pub fn register_service<S, T>(
        &mut self,
        name: &str,
        start: S,
        stop: T,
    ) -> Result<(), BootstrapError>
    where
        S: FnMut() -> ServiceFuture + Send + 'static,
        T: FnMut() -> ServiceFuture + Send + 'static,
    {
        self.register(name, None, Box::new(start), Box::new(stop))
    }

    pub fn register_typed_service<S, T>(
        &mut self,
        name: &str,
        kind: ServiceKind,
        start: S,
        stop: T,
    ) -> Result<(), BootstrapError>
    where
        S: FnMut() -> ServiceFuture + Send + 'static,
        T: FnMut() -> ServiceFuture + Send + 'static,
    {
        self.register(name, Some(kind), Box::new(start), Box::new(stop))
    }

    fn register(
        &mut self,
        name: &str,
        kind: Option<ServiceKind>,
        start: ServiceFn,
        stop: ServiceFn,
    ) -> Result<(), BootstrapError> {
        if self.index.contains_key(name) {
            return Err(BootstrapError::DuplicateService(name.to_string()));
        }
        self.index.insert(name.to_string(), self.services.len());
        self.graph.add_node(name);
        self.services.push(ServiceRecord {
            name: name.to_string(),
            kind,
            start,
            stop,
            state: ServiceState::Registered,
            last_error: None,
        });
        Ok(())
    }

    /// Declare `dependent` requires `prerequisite`; both must be registered.
    pub fn add_dependency(
        &mut self,
        dependent: &str,
        prerequisite: &str,
    ) -> Result<(), BootstrapError> {
        self.graph
            .add_edge(dependent, prerequisite)
            .map_err(BootstrapError::UnknownService)
    }

    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        self.graph.find_cycles()
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.index.get(name).map(|&i| self.services[i].state)
    }

    pub fn last_error(&self, name: &str) -> Option<String> {
        self.index.get(name).and_then(|&i| self.services[i].last_error.clone())
    }

    /// Start everything in dependency order. On the first failure, stop
    /// already-started services in reverse and surface the failure.
    pub async fn start(&mut self) -> Result<(), BootstrapError> {
        let order = match self.graph.topological_order() {
            Ok(order) => order,
            Err(cycles) => {
                tracing::error!(cycles = cycles.len(), "refusing startup: dependency cycles");
                return Err(BootstrapError::CircularDependency { cycles });
            }
        };

        for name in order {
            let i = self.index[&name];

            if let Err(e) = self.allocate_port(i).await {
                self.services[i].state = ServiceState::Failed;
                self.rollback().await;
                return Err(e);
            }

            tracing::info!(service = %name, "starting");
            let fut = {
                let record = &mut self.services[i];
                record.state = ServiceState::Starting;
                (record.start)()
            };

            match tokio::time::timeout(self.start_timeout, fut).await {
                Ok(Ok(())) => {
                    self.services[i].state = ServiceState::Ready;
                    self.started.push(i);
                    tracing::info!(service = %name, "ready");
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    tracing::error!(service = %name, error = %message, "startup failed");
                    let record = &mut self.services[i];
                    record.state = ServiceState::Failed;
                    record.last_error = Some(message.clone());
                    self.rollback().await;
                    return Err(BootstrapError::StartupFailed { service: name, message });
                }
                Err(_elapsed) => {
                    tracing::error!(service = %name, timeout = ?self.start_timeout, "startup timed out");
                    let record = &mut self.services[i];
                    record.state = ServiceState::Failed;
                    record.last_error = Some("startup timeout".to_string());
                    self.rollback().await;
                    return Err(BootstrapError::StartupTimeout {
                        service: name,
                        timeout: self.start_timeout,
                    });
                }
            }
        }
        Ok(())
    }

    async fn allocate_port(&mut self, i: usize) -> Result<(), BootstrapError> {
        let Some(config) = self.dynamic_ports.clone() else { return Ok(()) };
        let Some(kind) = self.services[i].kind else { return Ok(()) };

        let base = kind.base_port(&config);
        match config.find_available_port(base).await {
            Ok(port) => {
                config.set(kind.port_key(), port);
                tracing::info!(service = %self.services[i].name, port, "dynamic port published");
                Ok(())
            }
            Err(e) => Err(BootstrapError::PortAllocation {
                service: self.services[i].name.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn rollback(&mut self) {
        tracing::warn!(started = self.started.len(), "rolling back partial startup");
        let started = std::mem::take(&mut self.started);
        for &i in started.iter().rev() {
            self.stop_one(i).await;
        }
    }

    async fn stop_one(&mut self, i: usize) {
        let name = self.services[i].name.clone();
        tracing::info!(service = %name, "stopping");
        let fut = {
            let record = &mut self.services[i];
            record.state = ServiceState::Stopping;
            (record.stop)()
        };
        match tokio::time::timeout(self.stop_timeout, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(service = %name, error = %e, "stop reported an error");
                self.services[i].last_error = Some(e.to_string());
            }
            Err(_elapsed) => {
                tracing::warn!(service = %name, "stop timed out");
            }
        }
        self.services[i].state = ServiceState::Stopped;
    }

    /// Stop all started services in reverse start order. Safe to call more
    /// than once; only the first call does work.
    pub async fn shutdown(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;

        let started = std::mem::take(&mut self.started);
        for &i in started.iter().rev() {
            self.stop_one(i).await;
        }
        tracing::info!("shutdown complete");
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn recording_service(
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    ) -> (impl FnMut() -> ServiceFuture + Send, impl FnMut() -> ServiceFuture + Send) {
        let start_log = log.clone();
        let stop_log = log;
        (
            move || {
                let log = start_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("start:{name}"));
                    if fail_start {
                        return Err("refused".into());
                    }
                    Ok(())
                }) as ServiceFuture
            },
            move || {
                let log = stop_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("stop:{name}"));
                    Ok(())
                }) as ServiceFuture
            },
        )
    }

    #[tokio::test]
    async fn zero_services_start_instantly() {
        let mut bootstrap = Bootstrap::new();
        bootstrap.start().await.unwrap();
        bootstrap.shutdown().await;
    }

    #[tokio::test]
    async fn starts_in_dependency_order_and_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bootstrap = Bootstrap::new();

        for name in ["registry", "tracker", "peer"] {
            let (start, stop) = recording_service(name, log.clone(), false);
            bootstrap.register_service(name, start, stop).unwrap();
        }
        bootstrap.add_dependency("peer", "tracker").unwrap();
        bootstrap.add_dependency("tracker", "registry").unwrap();

        bootstrap.start().await.unwrap();
        assert_eq!(bootstrap.state("peer"), Some(ServiceState::Ready));

        bootstrap.shutdown().await;
        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start:registry",
                "start:tracker",
                "start:peer",
                "stop:peer",
                "stop:tracker",
                "stop:registry"
            ]
        );
        assert_eq!(bootstrap.state("peer"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn cycle_detection_blocks_startup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bootstrap = Bootstrap::new();
        for name in ["A", "B", "C"] {
            let (start, stop) = recording_service("node", log.clone(), false);
            bootstrap.register_service(name, start, stop).unwrap();
        }
        bootstrap.add_dependency("A", "B").unwrap();
        bootstrap.add_dependency("B", "C").unwrap();
        bootstrap.add_dependency("C", "A").unwrap();

        let err = bootstrap.start().await.unwrap_err();
        let cycles = err.formatted_cycles();
        assert_eq!(cycles, vec!["A -> B -> C -> A"]);
        assert!(log.lock().unwrap().is_empty(), "nothing may start with a cycle");
        assert_eq!(bootstrap.state("A"), Some(ServiceState::Registered));
    }

    #[tokio::test]
    async fn failed_start_rolls_back_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bootstrap = Bootstrap::new();

        let (start_a, stop_a) = recording_service("a", log.clone(), false);
        let (start_b, stop_b) = recording_service("b", log.clone(), false);
        let (start_c, stop_c) = recording_service("c", log.clone(), true);
        bootstrap.register_service("a", start_a, stop_a).unwrap();
        bootstrap.register_service("b", start_b, stop_b).unwrap();
        bootstrap.register_service("c", start_c, stop_c).unwrap();
        bootstrap.add_dependency("b", "a").unwrap();
        bootstrap.add_dependency("c", "b").unwrap();

        let err = bootstrap.start().await.unwrap_err();
        assert!(matches!(err, BootstrapError::StartupFailed { ref service, .. } if service == "c"));
        assert_eq!(bootstrap.state("c"), Some(ServiceState::Failed));
        assert_eq!(bootstrap.last_error("c").as_deref(), Some("refused"));

        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["start:a", "start:b", "start:c", "stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn slow_start_times_out() {
        let mut bootstrap = Bootstrap::new().with_start_timeout(Duration::from_millis(50));
        bootstrap
            .register_service(
                "slow",
                || {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }) as ServiceFuture
                },
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .unwrap();

        let err = bootstrap.start().await.unwrap_err();
        assert!(matches!(err, BootstrapError::StartupTimeout { .. }));
        assert_eq!(bootstrap.state("slow"), Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn shutdown_runs_exactly_once() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();
        let mut bootstrap = Bootstrap::new();
        bootstrap
            .register_service(
                "svc",
                || Box::pin(async { Ok(()) }) as ServiceFuture,
                move || {
                    let flag = stopped_clone.clone();
                    Box::pin(async move {
                        assert!(!flag.swap(true, Ordering::SeqCst), "stop ran twice");
                        Ok(())
                    }) as ServiceFuture
                },
            )
            .unwrap();

        bootstrap.start().await.unwrap();
        bootstrap.shutdown().await;
        bootstrap.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut bootstrap = Bootstrap::new();
        bootstrap
            .register_service(
                "svc",
                || Box::pin(async { Ok(()) }) as ServiceFuture,
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .unwrap();
        let err = bootstrap
            .register_service(
                "svc",
                || Box::pin(async { Ok(()) }) as ServiceFuture,
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .unwrap_err();
        assert!(matches!(err, BootstrapError::DuplicateService(_)));
    }

    #[tokio::test]
    async fn dependency_on_unregistered_service_errors() {
        let mut bootstrap = Bootstrap::new();
        bootstrap
            .register_service(
                "a",
                || Box::pin(async { Ok(()) }) as ServiceFuture,
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .unwrap();
        assert!(matches!(
            bootstrap.add_dependency("a", "ghost"),
            Err(BootstrapError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn dynamic_ports_publish_a_free_port() {
        let config = Arc::new(crate::config::ConfigStore::new());
        // Occupy the configured base so allocation has to move up
        let holder = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let base = holder.local_addr().unwrap().port();
        config.set("tracker.port", base);

        let mut bootstrap = Bootstrap::new().with_dynamic_ports(config.clone());
        bootstrap
            .register_typed_service(
                "tracker",
                ServiceKind::Tracker,
                || Box::pin(async { Ok(()) }) as ServiceFuture,
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .unwrap();

        bootstrap.start().await.unwrap();
        let published = config.get_port("tracker.port", 0);
        assert!(published > base, "published port must skip the occupied base");
        bootstrap.shutdown().await;
    }
}
