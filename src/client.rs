//! Protocol clients for the tracker and index server
//!
//! A client owns a bounded connection pool and a named recovery strategy;
//! every request is a correlated envelope exchange guarded by retry and a
//! circuit breaker. Server-side Error messages surface as coded failures
//! with their canonical retry guidance.

use crate::protocol::{
    read_envelope, write_envelope, CodecError, Envelope, ErrorCode, Message, PeerInfo, PeerRef,
    ReadOutcome,
};
use crate::resilience::{
    ConnectionFactory, ConnectionPool, ManagedConnection, PoolError, RecoveryManager,
    ResilienceError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection pool: {0}")]
    Pool(#[from] PoolError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by remote")]
    Closed,
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("response does not correlate with the request")]
    CorrelationMismatch,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last_backoff_millis: u64, last: Box<ClientError> },
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_)
            | ClientError::Pool(_)
            | ClientError::Timeout(_)
            | ClientError::Closed => true,
            ClientError::Server { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Server { code, .. } => code.guidance().retry_after,
            _ => None,
        }
    }

    /// Render this failure as the final protocol Error message. After retry
    /// exhaustion the envelope carries `attempts` and `lastBackoffMs`
    /// headers.
    pub fn to_error_envelope(
        &self,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Envelope {
        let mut envelope = Envelope::new(
            sender_id,
            receiver_id,
            Message::Error { code: self.error_code(), message: self.to_string() },
        );
        if let ClientError::Exhausted { attempts, last_backoff_millis, .. } = self {
            envelope = envelope
                .with_header(crate::protocol::HEADER_ATTEMPTS, attempts.to_string())
                .with_header(
                    crate::protocol::HEADER_LAST_BACKOFF_MS,
                    last_backoff_millis.to_string(),
                );
        }
        envelope
    }

    /// The wire code a final Error message should carry for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ClientError::Server { code, .. } => *code,
            ClientError::Timeout(_) => ErrorCode::Timeout,
            ClientError::Io(_) | ClientError::Closed => ErrorCode::ConnectionFailed,
            ClientError::Pool(_) => ErrorCode::ResourceExhausted,
            ClientError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            ClientError::CorrelationMismatch | ClientError::UnexpectedResponse(_) => {
                ErrorCode::InvalidMessage
            }
            ClientError::Exhausted { last, .. } => last.error_code(),
            ClientError::Cancelled => ErrorCode::ServiceUnavailable,
            ClientError::Codec(_) => ErrorCode::InvalidMessage,
        }
    }
}

impl From<ResilienceError<ClientError>> for ClientError {
    fn from(e: ResilienceError<ClientError>) -> Self {
        match e {
            ResilienceError::Inner(inner) => inner,
            ResilienceError::RetryExhausted { attempts, mut failures, last_backoff } => {
                let last = failures.pop().unwrap_or(ClientError::Closed);
                ClientError::Exhausted {
                    attempts,
                    last_backoff_millis: last_backoff.map(|d| d.as_millis() as u64).unwrap_or(0),
                    last: Box::new(last),
                }
            }
            ResilienceError::CircuitOpen { .. } => ClientError::Server {
                code: ErrorCode::CircuitBreakerOpen,
                message: e.to_string(),
            },
            ResilienceError::Timeout { timeout, .. } => ClientError::Timeout(timeout),
            ResilienceError::PoolExhausted { in_use, max } => {
                ClientError::Pool(PoolError::AcquireTimeout {
                    waited: Duration::ZERO,
                    in_use,
                    max,
                })
            }
            ResilienceError::Cancelled => ClientError::Cancelled,
        }
    }
}

pub struct TcpConnector {
    addr: String,
}

pub struct ClientConn {
    stream: BufReader<TcpStream>,
}

#[async_trait]
impl ManagedConnection for ClientConn {
    async fn is_valid(&mut self) -> bool {
        self.stream.get_ref().peer_addr().is_ok()
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    type Conn = ClientConn;

    async fn connect(&self) -> Result<ClientConn, PoolError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(ClientConn { stream: BufReader::new(stream) })
    }
}

/// Shared request/response plumbing for both clients.
pub struct ServiceClient {
    node_id: String,
    receiver_id: String,
    pool: ConnectionPool<TcpConnector>,
    timeout: Duration,
}

impl ServiceClient {
    pub fn new(
        addr: impl Into<String>,
        node_id: impl Into<String>,
        receiver_id: impl Into<String>,
        pool_max: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            receiver_id: receiver_id.into(),
            pool: ConnectionPool::new(TcpConnector { addr: addr.into() }, pool_max),
            timeout,
        }
    }

    /// One correlated request/response turn.
    pub async fn request(&self, message: Message) -> Result<Envelope, ClientError> {
        let mut conn = self.pool.acquire(self.timeout).await?;
        let request = Envelope::new(&self.node_id, &self.receiver_id, message);

        let exchange = async {
            write_envelope(&mut conn.stream, &request).await?;
            match read_envelope(&mut conn.stream).await? {
                ReadOutcome::Closed => Err(ClientError::Closed),
                ReadOutcome::Malformed(m) => {
                    Err(ClientError::UnexpectedResponse(m.detail))
                }
                ReadOutcome::Envelope(envelope) => Ok(envelope),
            }
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                conn.discard();
                return Err(e);
            }
            Err(_elapsed) => {
                conn.discard();
                return Err(ClientError::Timeout(self.timeout));
            }
        };

        if response.correlation_id.as_deref() != Some(request.message_id.as_str()) {
            // The stream is desynchronized; do not reuse it
            conn.discard();
            return Err(ClientError::CorrelationMismatch);
        }

        if let Message::Error { code, message } = &response.message {
            return Err(ClientError::Server { code: *code, message: message.clone() });
        }
        Ok(response)
    }

    /// Fire-and-forget send; used for heartbeats.
    pub async fn notify(&self, message: Message) -> Result<(), ClientError> {
        let mut conn = self.pool.acquire(self.timeout).await?;
        let envelope = Envelope::new(&self.node_id, &self.receiver_id, message);
        let outcome =
            tokio::time::timeout(self.timeout, write_envelope(&mut conn.stream, &envelope)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                conn.discard();
                Err(e.into())
            }
            Err(_elapsed) => {
                conn.discard();
                Err(ClientError::Timeout(self.timeout))
            }
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn recovery() -> Arc<RecoveryManager<ClientError>> {
    Arc::new(RecoveryManager::customized(
        None,
        ClientError::is_retryable,
        ClientError::retry_after,
    ))
}

/// Client for the tracker protocol.
pub struct TrackerClient {
    base: ServiceClient,
    recovery: Arc<RecoveryManager<ClientError>>,
}

impl TrackerClient {
    pub fn new(addr: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::with_timeout(addr, node_id, Duration::from_secs(5))
    }

    pub fn with_timeout(
        addr: impl Into<String>,
        node_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base: ServiceClient::new(addr, node_id, "tracker", 4, timeout),
            recovery: recovery(),
        }
    }

    async fn guarded(&self, message: Message) -> Result<Envelope, ClientError> {
        let strategy = self.recovery.strategy("tracker").expect("standard strategy set");
        strategy
            .execute(|| {
                let message = message.clone();
                async move {
                    self.base.request(message).await.map_err(ResilienceError::Inner)
                }
            })
            .await
            .map_err(ClientError::from)
    }

    pub async fn register(&self, peer_id: &str, host: &str, port: u16) -> Result<(), ClientError> {
        let response = self
            .guarded(Message::RegisterRequest {
                peer_id: peer_id.to_string(),
                host: host.to_string(),
                port,
            })
            .await?;
        match response.message {
            Message::RegisterResponse { success: true, .. } => Ok(()),
            Message::RegisterResponse { success: false, message } => {
                Err(ClientError::UnexpectedResponse(message.unwrap_or_default()))
            }
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn deregister(&self, peer_id: &str) -> Result<(), ClientError> {
        let response =
            self.guarded(Message::DeregisterRequest { peer_id: peer_id.to_string() }).await?;
        match response.message {
            Message::DeregisterResponse { .. } => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn discover(&self) -> Result<Vec<PeerInfo>, ClientError> {
        let response = self.guarded(Message::DiscoverRequest).await?;
        match response.message {
            Message::DiscoverResponse { peers } => Ok(peers),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn is_alive(&self, peer_id: &str) -> Result<bool, ClientError> {
        let response =
            self.guarded(Message::IsAliveRequest { peer_id: peer_id.to_string() }).await?;
        match response.message {
            Message::IsAliveResponse { alive } => Ok(alive),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// One-way liveness refresh.
    pub async fn heartbeat(&self, peer_id: &str) -> Result<(), ClientError> {
        self.base.notify(Message::Heartbeat { peer_id: peer_id.to_string() }).await
    }

    pub fn close(&self) {
        self.base.close();
    }
}

/// Client for the index server protocol.
pub struct IndexClient {
    base: ServiceClient,
    recovery: Arc<RecoveryManager<ClientError>>,
}

impl IndexClient {
    pub fn new(addr: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::with_timeout(addr, node_id, Duration::from_secs(5))
    }

    pub fn with_timeout(
        addr: impl Into<String>,
        node_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base: ServiceClient::new(addr, node_id, "indexserver", 4, timeout),
            recovery: recovery(),
        }
    }

    async fn guarded(&self, message: Message) -> Result<Envelope, ClientError> {
        let strategy = self.recovery.strategy("index-server").expect("standard strategy set");
        strategy
            .execute(|| {
                let message = message.clone();
                async move {
                    self.base.request(message).await.map_err(ResilienceError::Inner)
                }
            })
            .await
            .map_err(ClientError::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register_file(
        &self,
        file_name: &str,
        peer_id: &str,
        host: &str,
        port: u16,
        size: Option<u64>,
        checksum: Option<String>,
        mime_type: Option<String>,
    ) -> Result<(), ClientError> {
        let response = self
            .guarded(Message::RegisterFileRequest {
                file_name: file_name.to_string(),
                peer_id: peer_id.to_string(),
                host: host.to_string(),
                port,
                size,
                checksum,
                mime_type,
            })
            .await?;
        match response.message {
            Message::RegisterFileResponse { success: true } => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn unregister_file(&self, file_name: &str, peer_id: &str) -> Result<(), ClientError> {
        let response = self
            .guarded(Message::UnregisterFileRequest {
                file_name: file_name.to_string(),
                peer_id: peer_id.to_string(),
            })
            .await?;
        match response.message {
            Message::UnregisterFileResponse { .. } => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn deregister_peer(&self, peer_id: &str) -> Result<(), ClientError> {
        let response =
            self.guarded(Message::DeregisterRequest { peer_id: peer_id.to_string() }).await?;
        match response.message {
            Message::DeregisterResponse { .. } => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn get_peers_with_file(&self, file_name: &str) -> Result<Vec<PeerRef>, ClientError> {
        let response = self
            .guarded(Message::GetPeersWithFileRequest { file_name: file_name.to_string() })
            .await?;
        match response.message {
            Message::GetPeersWithFileResponse { peers, .. } => Ok(peers),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub async fn search(
        &self,
        pattern: &str,
        max_results: usize,
    ) -> Result<HashMap<String, Vec<PeerRef>>, ClientError> {
        let response = self
            .guarded(Message::SearchFilesRequest { pattern: pattern.to_string(), max_results })
            .await?;
        match response.message {
            Message::SearchFilesResponse { results } => Ok(results),
            other => Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub fn close(&self) {
        self.base.close();
    }
}
