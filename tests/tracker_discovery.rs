use filemesh::client::TrackerClient;
use filemesh::health::{HealthRegistry, MetricsRegistry};
use filemesh::registry::InMemoryRegistry;
use filemesh::shutdown::ShutdownController;
use filemesh::tracker::{TrackerConfig, TrackerServer};
use std::sync::Arc;
use std::time::Duration;

async fn start_tracker(peer_timeout: Duration) -> (std::net::SocketAddr, ShutdownController) {
    let tracker = TrackerServer::new(
        TrackerConfig {
            port: 0,
            peer_timeout,
            cleanup_interval: Duration::from_millis(100),
            ..Default::default()
        },
        Arc::new(HealthRegistry::new()),
        Arc::new(MetricsRegistry::new()),
        Arc::new(InMemoryRegistry::new()),
    );
    let ctrl = ShutdownController::new();
    let addr = tracker.start(ctrl.token()).await.unwrap();
    (addr, ctrl)
}

#[tokio::test]
async fn register_then_discover_from_another_peer() {
    let (addr, _ctrl) = start_tracker(Duration::from_secs(90)).await;

    let p1 = TrackerClient::new(addr.to_string(), "p1");
    p1.register("p1", "h", 8080).await.unwrap();

    let p2 = TrackerClient::new(addr.to_string(), "p2");
    let peers = p2.discover().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "p1");
    assert_eq!(peers[0].host, "h");
    assert_eq!(peers[0].port, 8080);

    assert!(p2.is_alive("p1").await.unwrap());
    assert!(!p2.is_alive("ghost").await.unwrap());
}

#[tokio::test]
async fn deregister_is_idempotent_and_removes_peer() {
    let (addr, _ctrl) = start_tracker(Duration::from_secs(90)).await;

    let client = TrackerClient::new(addr.to_string(), "p1");
    client.register("p1", "h", 8080).await.unwrap();
    client.deregister("p1").await.unwrap();
    client.deregister("p1").await.unwrap();

    assert!(client.discover().await.unwrap().is_empty());
}

#[tokio::test]
async fn heartbeat_keeps_peer_alive_past_timeout() {
    let (addr, _ctrl) = start_tracker(Duration::from_millis(300)).await;

    let client = TrackerClient::new(addr.to_string(), "p1");
    client.register("p1", "h", 8080).await.unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.heartbeat("p1").await.unwrap();
    }
    assert!(client.is_alive("p1").await.unwrap(), "heartbeats must refresh last-seen");

    // Stop heartbeating; the sweep takes the peer out
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!client.is_alive("p1").await.unwrap());
    assert!(client.discover().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_registration_is_rejected_with_a_coded_error() {
    let (addr, _ctrl) = start_tracker(Duration::from_secs(90)).await;

    let client = TrackerClient::new(addr.to_string(), "p1");
    let err = client.register("", "h", 8080).await.unwrap_err();
    // Outbound validation refuses to put the empty peer id on the wire
    assert!(!err.is_retryable());
}
