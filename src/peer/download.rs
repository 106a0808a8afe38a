//! Download client
//!
//! Each download is wrapped in an exponential-jitter retry and a per-peer
//! circuit breaker. Bytes land in a temp file that is renamed into place
//! only after the locally computed checksum matches the declared one; a
//! mismatch discards the temp file and is terminal for that peer.

use crate::client::ClientError;
use crate::protocol::{
    read_envelope, write_envelope, Envelope, ErrorCode, Message, PeerRef, ReadOutcome,
    HEADER_ORIGINAL_MESSAGE_ID,
};
use crate::resilience::{BackoffSchedule, CircuitBreaker, Jitter, ResilienceError, RetryPolicy};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

pub struct Downloader {
    node_id: String,
    download_dir: PathBuf,
    timeout: Duration,
    retry: RetryPolicy<ClientError>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl Downloader {
    pub fn new(node_id: impl Into<String>, download_dir: PathBuf, timeout: Duration) -> Self {
        let retry = RetryPolicy::builder()
            .max_attempts(4)
            .expect("attempts > 0")
            .backoff(
                BackoffSchedule::exponential(Duration::from_millis(200))
                    .with_max(Duration::from_secs(10)),
            )
            .with_jitter(Jitter::Bounded)
            .should_retry(ClientError::is_retryable)
            .retry_after_hint(ClientError::retry_after)
            .build();
        Self {
            node_id: node_id.into(),
            download_dir,
            timeout,
            retry,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, peer_id: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(peer_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(3, Duration::from_secs(30)))
            .clone()
    }

    /// Download `file_name` from one peer, with retries against that peer.
    pub async fn download(&self, file_name: &str, peer: &PeerRef) -> Result<PathBuf, ClientError> {
        if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
            return Err(ClientError::Server {
                code: ErrorCode::InvalidParameters,
                message: format!("refusing path-like file name '{file_name}'"),
            });
        }

        let breaker = self.breaker_for(&peer.peer_id);
        let result = self
            .retry
            .execute(|| {
                let breaker = breaker.clone();
                async move {
                    breaker
                        .execute(|| async {
                            self.attempt(file_name, peer).await.map_err(ResilienceError::Inner)
                        })
                        .await
                }
            })
            .await;
        result.map_err(ClientError::from)
    }

    /// Try each candidate peer in turn until one download verifies.
    pub async fn download_from_any(
        &self,
        file_name: &str,
        peers: &[PeerRef],
    ) -> Result<PathBuf, ClientError> {
        let mut last_error = ClientError::Server {
            code: ErrorCode::PeerUnavailable,
            message: format!("no peers offer '{file_name}'"),
        };
        for peer in peers {
            match self.download(file_name, peer).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    tracing::warn!(file_name, peer_id = %peer.peer_id, error = %e, "download failed, trying next peer");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn attempt(&self, file_name: &str, peer: &PeerRef) -> Result<PathBuf, ClientError> {
        let connect = TcpStream::connect(peer.addr());
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => return Err(ClientError::Timeout(self.timeout)),
        };
        stream.set_nodelay(true).ok();
        let mut stream = BufReader::new(stream);

        let request = Envelope::new(
            &self.node_id,
            &peer.peer_id,
            Message::FileRequest { file_name: file_name.to_string(), offset: None, length: None },
        );
        write_envelope(&mut stream, &request).await?;

        // FileResponse acknowledges the request before bytes flow
        match self.read_message(&mut stream).await? {
            (Message::FileResponse { accepted: true, .. }, _) => {}
            (Message::Error { code, message }, _) => {
                return Err(ClientError::Server { code, message })
            }
            (other, _) => return Err(ClientError::UnexpectedResponse(other.kind().to_string())),
        }

        let (transfer_id, file_size, declared, start_id) =
            match self.read_message(&mut stream).await? {
                (
                    Message::FileTransferStart { transfer_id, file_size, checksum, .. },
                    envelope_id,
                ) => (transfer_id, file_size, checksum, envelope_id),
                (Message::Error { code, message }, _) => {
                    return Err(ClientError::Server { code, message })
                }
                (other, _) => {
                    return Err(ClientError::UnexpectedResponse(other.kind().to_string()))
                }
            };

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let temp_path =
            self.download_dir.join(format!(".{file_name}.part-{}", Uuid::new_v4()));
        let received = self.receive_bytes(&mut stream, &temp_path, file_size).await;

        let computed = match received {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        // Completion frame closes the transfer
        match self.read_message(&mut stream).await {
            Ok((Message::FileTransferComplete { success: true, .. }, _)) => {}
            Ok((Message::FileTransferError { code, message, .. }, _)) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(ClientError::Server { code, message });
            }
            Ok((other, _)) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(ClientError::UnexpectedResponse(other.kind().to_string()));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        }

        if computed != declared {
            let _ = tokio::fs::remove_file(&temp_path).await;
            // Tell the peer which transfer failed verification
            let error = Envelope::new(&self.node_id, &peer.peer_id, Message::Error {
                code: ErrorCode::ChecksumMismatch,
                message: format!("declared {declared}, computed {computed}"),
            })
            .with_header(HEADER_ORIGINAL_MESSAGE_ID, start_id);
            let _ = write_envelope(&mut stream, &error).await;
            tracing::warn!(file_name, peer_id = %peer.peer_id, "checksum mismatch, temp file discarded");
            return Err(ClientError::ChecksumMismatch { declared, computed });
        }

        // Commit is atomic at the file level
        let final_path = self.download_dir.join(file_name);
        tokio::fs::rename(&temp_path, &final_path).await?;
        tracing::info!(file_name, bytes = file_size, peer_id = %peer.peer_id, "download complete");
        Ok(final_path)
    }

    async fn read_message(
        &self,
        stream: &mut BufReader<TcpStream>,
    ) -> Result<(Message, String), ClientError> {
        let outcome = tokio::time::timeout(self.timeout, read_envelope(stream)).await;
        match outcome {
            Ok(Ok(ReadOutcome::Envelope(envelope))) => {
                Ok((envelope.message, envelope.message_id))
            }
            Ok(Ok(ReadOutcome::Closed)) => Err(ClientError::Closed),
            Ok(Ok(ReadOutcome::Malformed(m))) => Err(ClientError::UnexpectedResponse(m.detail)),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Pull exactly `file_size` raw bytes into `temp_path`, hashing as they
    /// arrive.
    async fn receive_bytes(
        &self,
        stream: &mut BufReader<TcpStream>,
        temp_path: &PathBuf,
        file_size: u64,
    ) -> Result<String, ClientError> {
        let mut out = tokio::fs::File::create(temp_path).await?;
        let mut hasher = Sha256::new();
        let mut remaining = file_size;
        let mut buf = vec![0u8; 8192];

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = tokio::time::timeout(self.timeout, stream.read(&mut buf[..want])).await;
            let n = match read {
                Ok(Ok(0)) => return Err(ClientError::Closed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => return Err(ClientError::Timeout(self.timeout)),
            };
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        out.flush().await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn path_like_file_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let downloader =
            Downloader::new("client", dir.path().to_path_buf(), Duration::from_secs(1));
        let peer = PeerRef { peer_id: "p1".into(), host: "127.0.0.1".into(), port: 1 };

        for bad in ["../etc/passwd", "a/b.txt", "a\\b.txt"] {
            let err = downloader.download(bad, &peer).await.unwrap_err();
            assert_eq!(err.error_code(), ErrorCode::InvalidParameters, "{bad}");
        }
    }

    #[tokio::test]
    async fn unreachable_peer_trips_its_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let downloader =
            Downloader::new("client", dir.path().to_path_buf(), Duration::from_millis(200));
        // Port 1 on localhost refuses quickly
        let peer = PeerRef { peer_id: "p1".into(), host: "127.0.0.1".into(), port: 1 };

        // Three failed attempts open the per-peer breaker; the fourth fails
        // fast with the breaker code
        let err = downloader.download("a.txt", &peer).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CircuitBreakerOpen);

        // Another peer id gets its own breaker and fails on i/o instead
        let other = PeerRef { peer_id: "p2".into(), host: "127.0.0.1".into(), port: 1 };
        let err = downloader.download("a.txt", &other).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CircuitBreakerOpen);
    }
}
