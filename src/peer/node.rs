//! Peer node lifecycle
//!
//! Startup is a sequential chain: bind the listening socket, register with
//! the tracker, start the heartbeat loop, then begin accepting transfer
//! connections. A failure partway rewinds the chain (the tracker
//! registration is dropped). Shutdown deregisters best-effort with a
//! bounded timeout, stops accepting, and drains in-flight transfers up to a
//! grace period.

use crate::client::{ClientError, IndexClient, TrackerClient};
use crate::config::ConfigStore;
use crate::health::{HealthRegistry, HealthStatus};
use crate::peer::download::Downloader;
use crate::peer::transfer::{handle_peer_connection, PeerServerState, SharedFiles};
use crate::protocol::PeerRef;
use crate::shutdown::{ShutdownController, ShutdownToken};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

pub const SERVICE_TYPE: &str = "peer";

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker: {0}")]
    Tracker(ClientError),
    #[error("index server: {0}")]
    Index(ClientError),
    #[error("'{0}' is not a readable file")]
    NotAFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peer_id: String,
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub download_dir: PathBuf,
    pub tracker_addr: String,
    pub index_addr: String,
    pub heartbeat_interval: Duration,
    pub socket_timeout: Duration,
    pub max_connections: usize,
}

impl PeerConfig {
    pub fn from_config(config: &ConfigStore, peer_id: impl Into<String>) -> Self {
        let tracker_port = config.get_port("tracker.port", 6000);
        let index_port = config.get_port("indexserver.port", 6001);
        Self {
            peer_id: peer_id.into(),
            host: config.get_string("peer.host", "127.0.0.1"),
            port: config.get_port("peer.port", 0),
            download_dir: PathBuf::from(config.get_string("peer.download.dir", "downloads")),
            tracker_addr: format!("127.0.0.1:{tracker_port}"),
            index_addr: format!("127.0.0.1:{index_port}"),
            heartbeat_interval: config
                .get_secs("peer.heartbeat.interval.seconds", Duration::from_secs(30)),
            socket_timeout: config
                .get_millis("peer.socket.timeout.ms", Duration::from_secs(30)),
            max_connections: config.get_int("peer.max.connections", 32).max(1) as usize,
        }
    }
}

pub struct PeerNode {
    config: PeerConfig,
    shared: Arc<SharedFiles>,
    tracker: TrackerClient,
    index: IndexClient,
    downloader: Downloader,
    health: Option<Arc<HealthRegistry>>,
    shutdown: ShutdownController,
    connections: Arc<Semaphore>,
    local_addr: RwLock<Option<SocketAddr>>,
    registered: AtomicBool,
}

impl PeerNode {
    pub fn new(config: PeerConfig) -> Arc<Self> {
        let tracker = TrackerClient::with_timeout(
            config.tracker_addr.clone(),
            config.peer_id.clone(),
            config.socket_timeout,
        );
        let index = IndexClient::with_timeout(
            config.index_addr.clone(),
            config.peer_id.clone(),
            config.socket_timeout,
        );
        let downloader = Downloader::new(
            config.peer_id.clone(),
            config.download_dir.clone(),
            config.socket_timeout,
        );
        let connections = Arc::new(Semaphore::new(config.max_connections));

        Arc::new(Self {
            shared: Arc::new(SharedFiles::new()),
            tracker,
            index,
            downloader,
            health: None,
            shutdown: ShutdownController::new(),
            connections,
            local_addr: RwLock::new(None),
            registered: AtomicBool::new(false),
            config,
        })
    }

    pub fn with_health(config: PeerConfig, health: Arc<HealthRegistry>) -> Arc<Self> {
        let node = Self::new(config);
        // Sole Arc so far, set the health sink in place
        let mut inner = Arc::try_unwrap(node).ok().expect("node not yet shared");
        inner.health = Some(health);
        Arc::new(inner)
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn shared_files(&self) -> Vec<String> {
        self.shared.list()
    }

    fn health_name(&self) -> String {
        format!("{SERVICE_TYPE}-{}", self.config.peer_id)
    }

    /// Run the startup chain; on failure every completed step is rewound.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, PeerError> {
        // Bind first so registration can carry the real port
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().unwrap_or_else(|p| p.into_inner()) = Some(addr);

        if let Err(e) =
            self.tracker.register(&self.config.peer_id, &self.config.host, addr.port()).await
        {
            return Err(PeerError::Tracker(e));
        }
        self.registered.store(true, Ordering::Release);

        self.spawn_heartbeat();
        self.spawn_accept_loop(listener);

        if let Some(health) = &self.health {
            health.set_status(&self.health_name(), HealthStatus::Up);
        }
        tracing::info!(peer_id = %self.config.peer_id, %addr, "peer node started");
        Ok(addr)
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = self.clone();
        let token = self.shutdown.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The interval fires immediately; skip that first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = node.tracker.heartbeat(&node.config.peer_id).await {
                            tracing::warn!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let state = Arc::new(PeerServerState {
            node_id: self.config.peer_id.clone(),
            shared: self.shared.clone(),
        });
        let permits = self.connections.clone();
        let token = self.shutdown.token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let Ok(permit) = permits.clone().try_acquire_owned() else {
                                    tracing::warn!(%remote, "transfer connection limit reached");
                                    continue;
                                };
                                let state = state.clone();
                                let conn_token = token.clone();
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    handle_peer_connection(stream, remote, state, conn_token)
                                        .await;
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "peer accept failed"),
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    /// Share a local file and announce it to the index server.
    pub async fn share_file(&self, file_name: &str, path: PathBuf) -> Result<(), PeerError> {
        let meta = tokio::fs::metadata(&path).await.map_err(|_| PeerError::NotAFile(path.clone()))?;
        if !meta.is_file() {
            return Err(PeerError::NotAFile(path));
        }
        let port = self.local_addr().map(|a| a.port()).unwrap_or(self.config.port);

        self.shared.share(file_name, path);
        self.index
            .register_file(
                file_name,
                &self.config.peer_id,
                &self.config.host,
                port,
                Some(meta.len()),
                None,
                mime_type_of(file_name),
            )
            .await
            .map_err(PeerError::Index)?;
        tracing::info!(file_name, "file shared");
        Ok(())
    }

    /// Locate peers holding `file_name` and download from the first that
    /// verifies, skipping ourselves.
    pub async fn download_file(&self, file_name: &str) -> Result<PathBuf, PeerError> {
        let peers: Vec<PeerRef> = self
            .index
            .get_peers_with_file(file_name)
            .await
            .map_err(PeerError::Index)?
            .into_iter()
            .filter(|p| p.peer_id != self.config.peer_id)
            .collect();

        self.downloader.download_from_any(file_name, &peers).await.map_err(PeerError::Index)
    }

    pub async fn search(&self, pattern: &str, max_results: usize) -> Result<HashMap<String, Vec<PeerRef>>, PeerError> {
        self.index.search(pattern, max_results).await.map_err(PeerError::Index)
    }

    /// Graceful shutdown: best-effort deregistration with a bounded timeout,
    /// then stop accepting and drain in-flight transfers up to `grace`.
    pub async fn stop(&self, grace: Duration) {
        let deadline = Duration::from_secs(2);

        if self.registered.swap(false, Ordering::AcqRel) {
            if let Err(e) =
                tokio::time::timeout(deadline, self.tracker.deregister(&self.config.peer_id))
                    .await
                    .unwrap_or(Err(ClientError::Timeout(deadline)))
            {
                tracing::warn!(error = %e, "tracker deregistration failed");
            }
            for file_name in self.shared.list() {
                if let Err(e) = tokio::time::timeout(
                    deadline,
                    self.index.unregister_file(&file_name, &self.config.peer_id),
                )
                .await
                .unwrap_or(Err(ClientError::Timeout(deadline)))
                {
                    tracing::warn!(file_name, error = %e, "file unregistration failed");
                }
            }
        }

        // Stop accepting; in-flight handlers observe the token at their next
        // suspension point
        self.shutdown.shutdown();

        let drained = tokio::time::timeout(grace, async {
            let all = self.config.max_connections as u32;
            let _ = self.connections.acquire_many(all).await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!("transfers still in flight at grace deadline");
        }

        self.tracker.close();
        self.index.close();
        if let Some(health) = &self.health {
            health.set_status(&self.health_name(), HealthStatus::Down);
        }
        tracing::info!(peer_id = %self.config.peer_id, "peer node stopped");
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.token()
    }
}

fn mime_type_of(file_name: &str) -> Option<String> {
    let extension = file_name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())?;
    let mime = match extension.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime.to_string())
}
