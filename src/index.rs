//! Index server: the map from file names to the peers that hold them
//!
//! The edge map lives in memory behind per-file locks and is mirrored to a
//! JSON snapshot on disk so the index survives restart. A TTL cache fronts
//! hot-file lookups and is invalidated whenever that file's edges change.
//! If the snapshot cannot be read at startup the service reports DOWN and
//! refuses writes while serving whatever loaded.

use crate::config::ConfigStore;
use crate::health::{HealthRegistry, HealthStatus, MetricsRegistry};
use crate::protocol::{
    serve, Dispatcher, Envelope, ErrorCode, HandlerError, Message, MessageContext, MessageHandler,
    PeerRef,
};
use crate::registry::ServiceRegistry;
use crate::resilience::TtlCache;
use crate::shutdown::ShutdownToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SERVICE_TYPE: &str = "indexserver";

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub port: u16,
    pub host: String,
    pub storage_dir: PathBuf,
    pub storage_file: String,
    pub cache_ttl: Duration,
    pub cache_refresh: Duration,
    pub max_connections: usize,
}

impl IndexConfig {
    pub fn from_config(config: &ConfigStore) -> Self {
        Self {
            port: config.get_port("indexserver.port", 6001),
            host: config.get_string("indexserver.host", "127.0.0.1"),
            storage_dir: PathBuf::from(config.get_string("indexserver.storage.dir", "data")),
            storage_file: config.get_string("indexserver.storage.file", "file_index.dat"),
            cache_ttl: config.get_millis("indexserver.cache.ttl.ms", Duration::from_secs(60)),
            cache_refresh: config
                .get_millis("indexserver.cache.refresh.ms", Duration::from_secs(300)),
            max_connections: config.get_int("indexserver.connection.pool.max", 100).max(1)
                as usize,
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage_dir.join(&self.storage_file)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            port: 6001,
            host: "127.0.0.1".to_string(),
            storage_dir: PathBuf::from("data"),
            storage_file: "file_index.dat".to_string(),
            cache_ttl: Duration::from_secs(60),
            cache_refresh: Duration::from_secs(300),
            max_connections: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct FileRecord {
    peers: Vec<PeerRef>,
    #[serde(default)]
    meta: FileMeta,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index store is unreadable; writes are disabled")]
    ReadOnly,
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<IndexError> for HandlerError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::ReadOnly => HandlerError::new(ErrorCode::ServiceUnavailable, e.to_string()),
            IndexError::Storage(_) | IndexError::Encode(_) => {
                HandlerError::new(ErrorCode::FileAccessError, e.to_string())
            }
        }
    }
}

/// The in-memory edge map plus its disk mirror.
pub struct FileIndex {
    files: RwLock<HashMap<String, Arc<RwLock<FileRecord>>>>,
    cache: TtlCache<String, Vec<PeerRef>>,
    storage_path: PathBuf,
    read_only: AtomicBool,
    save_lock: tokio::sync::Mutex<()>,
}

impl FileIndex {
    pub fn new(storage_path: PathBuf, cache_ttl: Duration, cache_refresh: Duration) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            cache: TtlCache::new(cache_ttl).with_refresh_after(cache_refresh),
            storage_path,
            read_only: AtomicBool::new(false),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Allow writes again after an operator repaired the store.
    pub fn clear_read_only(&self) {
        self.read_only.store(false, Ordering::Release);
    }

    pub fn file_count(&self) -> usize {
        self.files.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Load the snapshot. A missing file is an empty index; an unreadable
    /// one flips the index read-only.
    pub async fn load(&self) -> Result<(), IndexError> {
        let raw = match tokio::fs::read(&self.storage_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.storage_path.display(), "no index snapshot, starting empty");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(path = %self.storage_path.display(), error = %e, "index snapshot unreadable");
                self.read_only.store(true, Ordering::Release);
                return Err(IndexError::Storage(e));
            }
        };

        match serde_json::from_slice::<HashMap<String, FileRecord>>(&raw) {
            Ok(snapshot) => {
                let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
                *files = snapshot
                    .into_iter()
                    .map(|(name, record)| (name, Arc::new(RwLock::new(record))))
                    .collect();
                tracing::info!(files = files.len(), "index snapshot loaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.storage_path.display(), error = %e, "index snapshot corrupt");
                self.read_only.store(true, Ordering::Release);
                Err(IndexError::Encode(e))
            }
        }
    }

    fn snapshot(&self) -> HashMap<String, FileRecord> {
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        files
            .iter()
            .map(|(name, record)| {
                (name.clone(), record.read().unwrap_or_else(|p| p.into_inner()).clone())
            })
            .collect()
    }

    /// Rewrite the snapshot atomically (temp file + rename).
    async fn persist(&self) -> Result<(), IndexError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot();
        let encoded = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(dir) = self.storage_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.storage_path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &self.storage_path).await?;
        Ok(())
    }

    fn check_writable(&self) -> Result<(), IndexError> {
        if self.is_read_only() {
            return Err(IndexError::ReadOnly);
        }
        Ok(())
    }

    /// Add the (file, peer) edge; idempotent on (file, peer_id).
    pub async fn register_file(
        &self,
        file_name: &str,
        peer: PeerRef,
        meta: FileMeta,
    ) -> Result<(), IndexError> {
        self.check_writable()?;

        let record = {
            let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
            files.entry(file_name.to_string()).or_default().clone()
        };
        {
            let mut record = record.write().unwrap_or_else(|p| p.into_inner());
            match record.peers.iter_mut().find(|p| p.peer_id == peer.peer_id) {
                Some(existing) => *existing = peer,
                None => record.peers.push(peer),
            }
            if meta != FileMeta::default() {
                record.meta = meta;
            }
        }

        self.cache.invalidate(&file_name.to_string());
        self.persist().await
    }

    /// Remove one (file, peer) edge.
    pub async fn unregister_file(&self, file_name: &str, peer_id: &str) -> Result<(), IndexError> {
        self.check_writable()?;

        let emptied = {
            let files = self.files.read().unwrap_or_else(|p| p.into_inner());
            match files.get(file_name) {
                Some(record) => {
                    let mut record = record.write().unwrap_or_else(|p| p.into_inner());
                    record.peers.retain(|p| p.peer_id != peer_id);
                    record.peers.is_empty()
                }
                None => false,
            }
        };
        if emptied {
            self.files.write().unwrap_or_else(|p| p.into_inner()).remove(file_name);
        }

        self.cache.invalidate(&file_name.to_string());
        self.persist().await
    }

    /// Remove every edge owned by `peer_id`.
    pub async fn deregister_peer(&self, peer_id: &str) -> Result<usize, IndexError> {
        self.check_writable()?;

        let mut touched = Vec::new();
        {
            let files = self.files.read().unwrap_or_else(|p| p.into_inner());
            for (name, record) in files.iter() {
                let mut record = record.write().unwrap_or_else(|p| p.into_inner());
                let before = record.peers.len();
                record.peers.retain(|p| p.peer_id != peer_id);
                if record.peers.len() < before {
                    touched.push(name.clone());
                }
            }
        }
        {
            let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
            files.retain(|_, record| {
                !record.read().unwrap_or_else(|p| p.into_inner()).peers.is_empty()
            });
        }

        for name in &touched {
            self.cache.invalidate(name);
        }
        self.persist().await?;
        Ok(touched.len())
    }

    /// Peers holding `file_name`, served through the TTL cache.
    pub async fn peers_with_file(&self, file_name: &str) -> Vec<PeerRef> {
        let lookup = || {
            let files = self.files.read().unwrap_or_else(|p| p.into_inner());
            files
                .get(file_name)
                .map(|record| record.read().unwrap_or_else(|p| p.into_inner()).peers.clone())
                .unwrap_or_default()
        };
        self.cache
            .get_or_load(file_name.to_string(), || async { Ok::<_, std::io::Error>(lookup()) })
            .await
            .unwrap_or_default()
    }

    /// Glob-ish search: `*` matches any substring; a plain token matches by
    /// substring on the name or the MIME type. Matching ignores case.
    pub fn search(&self, pattern: &str, max_results: usize) -> HashMap<String, Vec<PeerRef>> {
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<&String> = files.keys().collect();
        names.sort();

        let mut results = HashMap::new();
        for name in names {
            if results.len() >= max_results {
                break;
            }
            let record = files[name].read().unwrap_or_else(|p| p.into_inner());
            if pattern_matches(pattern, name, record.meta.mime_type.as_deref()) {
                results.insert(name.clone(), record.peers.clone());
            }
        }
        results
    }
}

fn pattern_matches(pattern: &str, name: &str, mime_type: Option<&str>) -> bool {
    let pattern = pattern.to_lowercase();
    let name = name.to_lowercase();

    if pattern.contains('*') {
        return glob_matches(&pattern, &name);
    }
    if name.contains(&pattern) {
        return true;
    }
    mime_type.map(|m| m.to_lowercase().contains(&pattern)).unwrap_or(false)
}

/// `*` matches any substring; everything else is literal.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut position = 0usize;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        match text[position..].find(segment) {
            Some(found) => {
                let at = position + found;
                // A leading literal must anchor at the start
                if i == 0 && at != 0 {
                    return false;
                }
                position = at + segment.len();
            }
            None => return false,
        }
    }

    // A trailing literal must anchor at the end
    match segments.last() {
        Some(last) if !last.is_empty() && !pattern.ends_with('*') => text.ends_with(last),
        _ => true,
    }
}

struct IndexHandler {
    index: Arc<FileIndex>,
    metrics: Arc<MetricsRegistry>,
}

#[async_trait]
impl MessageHandler for IndexHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        _ctx: &MessageContext,
    ) -> Result<Option<Message>, HandlerError> {
        match &envelope.message {
            Message::RegisterFileRequest { file_name, peer_id, host, port, size, checksum, mime_type } => {
                let peer =
                    PeerRef { peer_id: peer_id.clone(), host: host.clone(), port: *port };
                let meta = FileMeta {
                    size: *size,
                    checksum: checksum.clone(),
                    mime_type: mime_type.clone(),
                };
                self.index.register_file(file_name, peer, meta).await?;
                self.metrics.increment(SERVICE_TYPE, "register_file");
                tracing::info!(file_name, peer_id, "file registered");
                Ok(Some(Message::RegisterFileResponse { success: true }))
            }
            Message::UnregisterFileRequest { file_name, peer_id } => {
                self.index.unregister_file(file_name, peer_id).await?;
                self.metrics.increment(SERVICE_TYPE, "unregister_file");
                Ok(Some(Message::UnregisterFileResponse { success: true }))
            }
            Message::DeregisterRequest { peer_id } => {
                let removed = self.index.deregister_peer(peer_id).await?;
                tracing::info!(peer_id, removed, "peer deregistered from index");
                Ok(Some(Message::DeregisterResponse { success: true }))
            }
            Message::GetPeersWithFileRequest { file_name } => {
                self.metrics.increment(SERVICE_TYPE, "get_peers");
                Ok(Some(Message::GetPeersWithFileResponse {
                    file_name: file_name.clone(),
                    peers: self.index.peers_with_file(file_name).await,
                }))
            }
            Message::SearchFilesRequest { pattern, max_results } => {
                self.metrics.increment(SERVICE_TYPE, "search");
                Ok(Some(Message::SearchFilesResponse {
                    results: self.index.search(pattern, *max_results),
                }))
            }
            Message::Ping => Ok(Some(Message::Pong)),
            other => Err(HandlerError::new(
                ErrorCode::UnknownCommand,
                format!("index server does not handle '{}'", other.kind()),
            )),
        }
    }
}

pub struct IndexServer {
    config: IndexConfig,
    index: Arc<FileIndex>,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthRegistry>,
    registry: Arc<dyn ServiceRegistry>,
    service_id: String,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl IndexServer {
    pub fn new(
        config: IndexConfig,
        health: Arc<HealthRegistry>,
        metrics: Arc<MetricsRegistry>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Arc<Self> {
        let index = Arc::new(FileIndex::new(
            config.storage_path(),
            config.cache_ttl,
            config.cache_refresh,
        ));

        let dispatcher = Arc::new(Dispatcher::new(SERVICE_TYPE));
        let handler = Arc::new(IndexHandler { index: index.clone(), metrics });
        for kind in [
            "register_file_request",
            "unregister_file_request",
            "deregister_request",
            "get_peers_with_file_request",
            "search_files_request",
            "ping",
        ] {
            dispatcher.register_handler(kind, 0, handler.clone());
        }

        Arc::new(Self {
            config,
            index,
            dispatcher,
            health,
            registry,
            service_id: format!("{SERVICE_TYPE}-1"),
            local_addr: RwLock::new(None),
        })
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn start(self: &Arc<Self>, shutdown: ShutdownToken) -> std::io::Result<SocketAddr> {
        let load_failed = self.index.load().await.is_err();

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().unwrap_or_else(|p| p.into_inner()) = Some(addr);

        tokio::spawn(serve(
            listener,
            self.dispatcher.clone(),
            self.config.max_connections,
            shutdown.clone(),
        ));

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
            tracing::warn!(error = %e, "index server could not announce itself");
        }

        let mut details = HashMap::new();
        details.insert("files".to_string(), self.index.file_count().to_string());
        if load_failed {
            details.insert("store".to_string(), "unreadable".to_string());
            self.health.set_status_with_details(SERVICE_TYPE, HealthStatus::Down, details);
        } else {
            self.health.set_status_with_details(SERVICE_TYPE, HealthStatus::Up, details);
        }

        tracing::info!(%addr, read_only = self.index.is_read_only(), "index server listening");
        Ok(addr)
    }

    pub async fn stop(&self) {
        let _ = self.registry.deregister_service(SERVICE_TYPE, &self.service_id).await;
        self.health.set_status(SERVICE_TYPE, HealthStatus::Down);
        tracing::info!("index server stopped");
    }
}
