use filemesh::client::IndexClient;
use filemesh::health::{HealthRegistry, HealthStatus, MetricsRegistry};
use filemesh::index::{IndexConfig, IndexServer};
use filemesh::registry::InMemoryRegistry;
use filemesh::shutdown::ShutdownController;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    addr: std::net::SocketAddr,
    _ctrl: ShutdownController,
    _dir: tempfile::TempDir,
}

async fn start_index() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let index = IndexServer::new(
        IndexConfig {
            port: 0,
            storage_dir: dir.path().to_path_buf(),
            cache_ttl: Duration::from_millis(200),
            ..Default::default()
        },
        Arc::new(HealthRegistry::new()),
        Arc::new(MetricsRegistry::new()),
        Arc::new(InMemoryRegistry::new()),
    );
    let ctrl = ShutdownController::new();
    let addr = index.start(ctrl.token()).await.unwrap();
    Fixture { addr, _ctrl: ctrl, _dir: dir }
}

async fn seed(client: &IndexClient) {
    client.register_file("a.txt", "p1", "h1", 7001, Some(10), None, None).await.unwrap();
    client.register_file("b.txt", "p2", "h2", 7002, Some(20), None, None).await.unwrap();
    client.register_file("note_a.pdf", "p1", "h1", 7001, None, None, None).await.unwrap();
    client.register_file("note_a.pdf", "p2", "h2", 7002, None, None, None).await.unwrap();
}

#[tokio::test]
async fn search_star_a_star_returns_exactly_the_matching_files() {
    let fixture = start_index().await;
    let client = IndexClient::new(fixture.addr.to_string(), "client");
    seed(&client).await;

    let results = client.search("*a*", 10).await.unwrap();
    let mut names: Vec<_> = results.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "note_a.pdf"]);
    assert_eq!(results["note_a.pdf"].len(), 2);
}

#[tokio::test]
async fn get_peers_reflects_registrations_and_idempotence() {
    let fixture = start_index().await;
    let client = IndexClient::new(fixture.addr.to_string(), "client");
    seed(&client).await;

    // Same (file, peer) twice leaves the index unchanged
    client.register_file("a.txt", "p1", "h1", 7001, Some(10), None, None).await.unwrap();
    let peers = client.get_peers_with_file("a.txt").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "p1");

    let none = client.get_peers_with_file("missing.bin").await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn deregister_peer_removes_every_edge_of_that_peer() {
    let fixture = start_index().await;
    let client = IndexClient::new(fixture.addr.to_string(), "client");
    seed(&client).await;

    client.deregister_peer("p1").await.unwrap();

    // The cache is invalidated by the mutation, so reads see the removal
    assert!(client.get_peers_with_file("a.txt").await.unwrap().is_empty());
    let note_peers = client.get_peers_with_file("note_a.pdf").await.unwrap();
    assert_eq!(note_peers.len(), 1);
    assert_eq!(note_peers[0].peer_id, "p2");
}

#[tokio::test]
async fn unregister_file_removes_one_edge() {
    let fixture = start_index().await;
    let client = IndexClient::new(fixture.addr.to_string(), "client");
    seed(&client).await;

    client.unregister_file("note_a.pdf", "p2").await.unwrap();
    let peers = client.get_peers_with_file("note_a.pdf").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "p1");
}

#[tokio::test]
async fn index_reports_up_and_persists_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = IndexConfig {
        port: 0,
        storage_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    {
        let health = Arc::new(HealthRegistry::new());
        let index = IndexServer::new(
            config.clone(),
            health.clone(),
            Arc::new(MetricsRegistry::new()),
            Arc::new(InMemoryRegistry::new()),
        );
        let ctrl = ShutdownController::new();
        let addr = index.start(ctrl.token()).await.unwrap();
        assert_eq!(health.record("indexserver").unwrap().status, HealthStatus::Up);

        let client = IndexClient::new(addr.to_string(), "client");
        client.register_file("kept.txt", "p1", "h1", 7001, None, None, None).await.unwrap();
        index.stop().await;
        ctrl.shutdown();
    }

    // New process, same storage dir
    let index = IndexServer::new(
        config,
        Arc::new(HealthRegistry::new()),
        Arc::new(MetricsRegistry::new()),
        Arc::new(InMemoryRegistry::new()),
    );
    let ctrl = ShutdownController::new();
    let addr = index.start(ctrl.token()).await.unwrap();

    let client = IndexClient::new(addr.to_string(), "client");
    let peers = client.get_peers_with_file("kept.txt").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "p1");
}

#[tokio::test]
async fn corrupt_store_reports_down_and_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("file_index.dat"), b"not json at all").await.unwrap();

    let fixture_health = Arc::new(HealthRegistry::new());
    let index = IndexServer::new(
        IndexConfig { port: 0, storage_dir: dir.path().to_path_buf(), ..Default::default() },
        fixture_health.clone(),
        Arc::new(MetricsRegistry::new()),
        Arc::new(InMemoryRegistry::new()),
    );
    let ctrl = ShutdownController::new();
    let addr = index.start(ctrl.token()).await.unwrap();

    assert_eq!(fixture_health.record("indexserver").unwrap().status, HealthStatus::Down);

    let client = IndexClient::new(addr.to_string(), "client");
    let err = client
        .register_file("a.txt", "p1", "h1", 7001, None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), filemesh::protocol::ErrorCode::ServiceUnavailable);

    // Reads still work against whatever loaded (nothing, here)
    assert!(client.get_peers_with_file("a.txt").await.unwrap().is_empty());
}
