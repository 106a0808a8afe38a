//! Convenient re-exports for common filemesh types.
pub use crate::{
    bootstrap::{Bootstrap, BootstrapError, Context, ServiceKind, ServiceState},
    client::{ClientError, IndexClient, TrackerClient},
    config::{ConfigError, ConfigStore},
    health::{HealthRegistry, HealthStatus, MetricsRegistry},
    index::{FileIndex, IndexConfig, IndexServer},
    peer::{PeerConfig, PeerError, PeerNode},
    protocol::{
        Dispatcher, Envelope, ErrorCode, HandlerError, Message, MessageContext, MessageHandler,
        PeerInfo, PeerRef,
    },
    registry::{
        GossipConfig, GossipRegistry, InMemoryRegistry, ServiceInstance, ServiceLocator,
        ServiceRegistry,
    },
    resilience::{
        BackoffSchedule, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool,
        Jitter, RecoveryManager, RecoveryStrategy, ResilienceError, RetryPolicy, RetryStrategy,
        TaskPoolManager, TtlCache,
    },
    shutdown::{ShutdownController, ShutdownToken},
    tracker::{TrackerConfig, TrackerServer},
};
