use filemesh::client::ClientError;
use filemesh::health::{HealthRegistry, MetricsRegistry};
use filemesh::index::{IndexConfig, IndexServer};
use filemesh::peer::{Downloader, PeerConfig, PeerNode};
use filemesh::protocol::{
    read_envelope, write_envelope, Envelope, ErrorCode, Message, PeerRef, ReadOutcome,
    TRANSFER_CHUNK_SIZE,
};
use filemesh::registry::InMemoryRegistry;
use filemesh::shutdown::ShutdownController;
use filemesh::tracker::{TrackerConfig, TrackerServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

struct Overlay {
    tracker_addr: std::net::SocketAddr,
    index_addr: std::net::SocketAddr,
    _ctrl: ShutdownController,
    _dir: tempfile::TempDir,
}

async fn start_overlay() -> Overlay {
    let dir = tempfile::tempdir().unwrap();
    let health = Arc::new(HealthRegistry::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let registry = Arc::new(InMemoryRegistry::new());
    let ctrl = ShutdownController::new();

    let tracker = TrackerServer::new(
        TrackerConfig { port: 0, ..Default::default() },
        health.clone(),
        metrics.clone(),
        registry.clone(),
    );
    let tracker_addr = tracker.start(ctrl.token()).await.unwrap();

    let index = IndexServer::new(
        IndexConfig { port: 0, storage_dir: dir.path().join("index"), ..Default::default() },
        health,
        metrics,
        registry,
    );
    let index_addr = index.start(ctrl.token()).await.unwrap();

    Overlay { tracker_addr, index_addr, _ctrl: ctrl, _dir: dir }
}

fn peer_config(overlay: &Overlay, peer_id: &str, download_dir: std::path::PathBuf) -> PeerConfig {
    PeerConfig {
        peer_id: peer_id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        download_dir,
        tracker_addr: overlay.tracker_addr.to_string(),
        index_addr: overlay.index_addr.to_string(),
        heartbeat_interval: Duration::from_millis(200),
        socket_timeout: Duration::from_secs(5),
        max_connections: 8,
    }
}

#[tokio::test]
async fn shared_file_downloads_intact_between_peers() {
    let overlay = start_overlay().await;
    let work = tempfile::tempdir().unwrap();

    let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let source_path = work.path().join("document.pdf");
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let seeder = PeerNode::new(peer_config(&overlay, "p1", work.path().join("p1-downloads")));
    seeder.start().await.unwrap();
    seeder.share_file("document.pdf", source_path).await.unwrap();

    let leecher = PeerNode::new(peer_config(&overlay, "p2", work.path().join("p2-downloads")));
    leecher.start().await.unwrap();

    let downloaded = leecher.download_file("document.pdf").await.unwrap();
    let bytes = tokio::fs::read(&downloaded).await.unwrap();
    assert_eq!(bytes, payload, "downloaded bytes must match the source exactly");

    seeder.stop(Duration::from_secs(2)).await;
    leecher.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn search_finds_files_shared_by_peers() {
    let overlay = start_overlay().await;
    let work = tempfile::tempdir().unwrap();

    let source = work.path().join("alpha.txt");
    tokio::fs::write(&source, b"hello").await.unwrap();

    let peer = PeerNode::new(peer_config(&overlay, "p1", work.path().join("dl")));
    peer.start().await.unwrap();
    peer.share_file("alpha.txt", source).await.unwrap();

    let results = peer.search("*alpha*", 10).await.unwrap();
    assert!(results.contains_key("alpha.txt"));

    peer.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn peer_shutdown_deregisters_everywhere() {
    let overlay = start_overlay().await;
    let work = tempfile::tempdir().unwrap();

    let source = work.path().join("gone.txt");
    tokio::fs::write(&source, b"bye").await.unwrap();

    let peer = PeerNode::new(peer_config(&overlay, "p1", work.path().join("dl")));
    peer.start().await.unwrap();
    peer.share_file("gone.txt", source).await.unwrap();
    peer.stop(Duration::from_secs(2)).await;

    let observer = PeerNode::new(peer_config(&overlay, "p2", work.path().join("dl2")));
    observer.start().await.unwrap();

    let err = observer.download_file("gone.txt").await.unwrap_err();
    // Nothing offers the file any more
    assert!(format!("{err}").contains("gone.txt") || format!("{err}").contains("peer"));

    observer.stop(Duration::from_secs(2)).await;
}

/// A peer that lies about the checksum: the client must refuse the bytes and
/// keep the download directory clean.
#[tokio::test]
async fn checksum_mismatch_discards_the_temp_file() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);

        let request = match read_envelope(&mut stream).await.unwrap() {
            ReadOutcome::Envelope(envelope) => envelope,
            other => panic!("expected request, got {other:?}"),
        };
        assert!(matches!(request.message, Message::FileRequest { .. }));

        let body = b"these bytes do not hash to H".to_vec();
        let accept = Envelope::respond_to(
            &request,
            "liar",
            Message::FileResponse {
                file_name: "document.pdf".into(),
                accepted: true,
                file_size: Some(body.len() as u64),
            },
        );
        write_envelope(&mut stream, &accept).await.unwrap();

        let start = Envelope::new(
            "liar",
            &request.sender_id,
            Message::FileTransferStart {
                transfer_id: "t-1".into(),
                file_name: "document.pdf".into(),
                file_size: body.len() as u64,
                checksum: "48".repeat(32),
                chunk_size: TRANSFER_CHUNK_SIZE,
            },
        );
        let start_id = start.message_id.clone();
        write_envelope(&mut stream, &start).await.unwrap();

        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();

        let complete = Envelope::new(
            "liar",
            &request.sender_id,
            Message::FileTransferComplete {
                transfer_id: "t-1".into(),
                success: true,
                bytes_transferred: body.len() as u64,
            },
        );
        write_envelope(&mut stream, &complete).await.unwrap();

        // The client reports the mismatch against the transfer start
        match read_envelope(&mut stream).await.unwrap() {
            ReadOutcome::Envelope(error) => {
                assert!(matches!(
                    error.message,
                    Message::Error { code: ErrorCode::ChecksumMismatch, .. }
                ));
                assert_eq!(
                    error.headers.get(filemesh::protocol::HEADER_ORIGINAL_MESSAGE_ID),
                    Some(&start_id)
                );
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    });

    let download_dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        "client",
        download_dir.path().to_path_buf(),
        Duration::from_secs(2),
    );
    let peer = PeerRef { peer_id: "liar".into(), host: "127.0.0.1".into(), port: addr.port() };

    let err = downloader.download("document.pdf", &peer).await.unwrap_err();
    match err {
        ClientError::ChecksumMismatch { declared, .. } => {
            assert_eq!(declared, "48".repeat(32));
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }

    // No committed file and no leftover temp file
    let mut entries = tokio::fs::read_dir(download_dir.path()).await.unwrap();
    assert!(
        entries.next_entry().await.unwrap().is_none(),
        "download dir must stay clean after a mismatch"
    );
}
