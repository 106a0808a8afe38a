//! Peer-side file serving
//!
//! Control messages are newline-delimited JSON envelopes; file bytes stream
//! raw between FileTransferStart and FileTransferComplete, bounded by an
//! optional byte range. No per-chunk acks: the completion message is the
//! only acknowledgement. Checksums cover exactly the bytes streamed and are
//! cached per file for full-file transfers.

use crate::protocol::{
    read_envelope, write_envelope, Envelope, ErrorCode, Message, ReadOutcome, TRANSFER_CHUNK_SIZE,
};
use crate::shutdown::ShutdownToken;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

/// The set of files this peer serves, with lazily computed checksums.
#[derive(Default)]
pub struct SharedFiles {
    files: RwLock<HashMap<String, PathBuf>>,
    checksums: RwLock<HashMap<String, String>>,
}

impl SharedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share(&self, file_name: &str, path: PathBuf) {
        self.files.write().unwrap_or_else(|p| p.into_inner()).insert(file_name.to_string(), path);
        self.checksums.write().unwrap_or_else(|p| p.into_inner()).remove(file_name);
    }

    pub fn unshare(&self, file_name: &str) {
        self.files.write().unwrap_or_else(|p| p.into_inner()).remove(file_name);
        self.checksums.write().unwrap_or_else(|p| p.into_inner()).remove(file_name);
    }

    pub fn path_of(&self, file_name: &str) -> Option<PathBuf> {
        self.files.read().unwrap_or_else(|p| p.into_inner()).get(file_name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.files.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }

    /// Full-file checksum, computed on first use and cached until re-shared.
    pub async fn checksum_of(&self, file_name: &str, path: &Path) -> std::io::Result<String> {
        if let Some(cached) =
            self.checksums.read().unwrap_or_else(|p| p.into_inner()).get(file_name)
        {
            return Ok(cached.clone());
        }
        let size = tokio::fs::metadata(path).await?.len();
        let checksum = checksum_range(path, 0, size).await?;
        self.checksums
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(file_name.to_string(), checksum.clone());
        Ok(checksum)
    }
}

/// SHA-256 over `length` bytes starting at `offset`, hex encoded.
pub async fn checksum_range(path: &Path, offset: u64, length: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut hasher = Sha256::new();
    let mut remaining = length;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE as usize];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// State handed to every inbound peer connection.
pub struct PeerServerState {
    pub node_id: String,
    pub shared: Arc<SharedFiles>,
}

/// Process one inbound connection: Pings and FileRequests in a loop until
/// the remote closes or shutdown fires.
pub async fn handle_peer_connection(
    stream: TcpStream,
    remote: std::net::SocketAddr,
    state: Arc<PeerServerState>,
    shutdown: ShutdownToken,
) {
    let mut stream = BufReader::new(stream);

    loop {
        let outcome = tokio::select! {
            outcome = read_envelope(&mut stream) => outcome,
            _ = shutdown.cancelled() => break,
        };

        match outcome {
            Ok(ReadOutcome::Closed) => break,
            Ok(ReadOutcome::Envelope(request)) => match &request.message {
                Message::Ping => {
                    let pong = Envelope::respond_to(&request, &state.node_id, Message::Pong);
                    if write_envelope(&mut stream, &pong).await.is_err() {
                        break;
                    }
                }
                Message::FileRequest { file_name, offset, length } => {
                    let done = serve_file(
                        &mut stream,
                        &state,
                        &request,
                        file_name,
                        *offset,
                        *length,
                    )
                    .await;
                    if done.is_err() {
                        break;
                    }
                }
                other => {
                    let error = Envelope::error_for(
                        &request,
                        &state.node_id,
                        ErrorCode::UnknownCommand,
                        format!("peer does not handle '{}'", other.kind()),
                    );
                    if write_envelope(&mut stream, &error).await.is_err() {
                        break;
                    }
                }
            },
            Ok(ReadOutcome::Malformed(malformed)) => {
                let error = Envelope::error_raw(
                    &state.node_id,
                    malformed.sender_id.clone().unwrap_or_else(|| "unknown".to_string()),
                    malformed.original_message_id.clone(),
                    malformed.code,
                    malformed.detail,
                );
                if write_envelope(&mut stream, &error).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%remote, error = %e, "peer connection read failed");
                break;
            }
        }
    }
}

async fn serve_file(
    stream: &mut BufReader<TcpStream>,
    state: &PeerServerState,
    request: &Envelope,
    file_name: &str,
    offset: Option<u64>,
    length: Option<u64>,
) -> std::io::Result<()> {
    let Some(path) = state.shared.path_of(file_name) else {
        let error = Envelope::error_for(
            request,
            &state.node_id,
            ErrorCode::FileNotFound,
            format!("'{file_name}' is not shared by this peer"),
        );
        return write_envelope(stream, &error).await.map_err(codec_to_io);
    };

    let total = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!(file_name, error = %e, "shared file unreadable");
            let error = Envelope::error_for(
                request,
                &state.node_id,
                ErrorCode::FileAccessError,
                e.to_string(),
            );
            return write_envelope(stream, &error).await.map_err(codec_to_io);
        }
    };

    let offset = offset.unwrap_or(0);
    let length = length.unwrap_or_else(|| total.saturating_sub(offset));
    if offset > total || offset.saturating_add(length) > total {
        let error = Envelope::error_for(
            request,
            &state.node_id,
            ErrorCode::InvalidParameters,
            format!("range {offset}+{length} exceeds file size {total}"),
        );
        return write_envelope(stream, &error).await.map_err(codec_to_io);
    }

    let full_file = offset == 0 && length == total;
    let checksum = if full_file {
        state.shared.checksum_of(file_name, &path).await?
    } else {
        checksum_range(&path, offset, length).await?
    };

    let accept = Envelope::respond_to(
        request,
        &state.node_id,
        Message::FileResponse {
            file_name: file_name.to_string(),
            accepted: true,
            file_size: Some(length),
        },
    );
    write_envelope(stream, &accept).await.map_err(codec_to_io)?;

    let transfer_id = Uuid::new_v4().to_string();
    let start = Envelope::new(
        &state.node_id,
        &request.sender_id,
        Message::FileTransferStart {
            transfer_id: transfer_id.clone(),
            file_name: file_name.to_string(),
            file_size: length,
            checksum,
            chunk_size: TRANSFER_CHUNK_SIZE,
        },
    );
    write_envelope(stream, &start).await.map_err(codec_to_io)?;

    match stream_bytes(stream, &path, offset, length).await {
        Ok(sent) => {
            let complete = Envelope::new(
                &state.node_id,
                &request.sender_id,
                Message::FileTransferComplete {
                    transfer_id,
                    success: true,
                    bytes_transferred: sent,
                },
            );
            write_envelope(stream, &complete).await.map_err(codec_to_io)?;
            tracing::info!(file_name, bytes = sent, "file served");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(file_name, error = %e, "transfer failed mid-stream");
            let error = Envelope::new(
                &state.node_id,
                &request.sender_id,
                Message::FileTransferError {
                    transfer_id,
                    code: ErrorCode::FileAccessError,
                    message: e.to_string(),
                },
            );
            // Best effort; the stream may already be unusable
            let _ = write_envelope(stream, &error).await;
            Err(e)
        }
    }
}

async fn stream_bytes(
    stream: &mut BufReader<TcpStream>,
    path: &Path,
    offset: u64,
    length: u64,
) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut remaining = length;
    let mut sent = 0u64;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE as usize];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shrank while streaming",
            ));
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
        remaining -= n as u64;
    }
    stream.flush().await?;
    Ok(sent)
}

fn codec_to_io(e: crate::protocol::CodecError) -> std::io::Error {
    match e {
        crate::protocol::CodecError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checksum_is_cached_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let shared = SharedFiles::new();
        shared.share("a.bin", path.clone());

        let first = shared.checksum_of("a.bin", &path).await.unwrap();
        let second = shared.checksum_of("a.bin", &path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64, "hex sha-256");
    }

    #[tokio::test]
    async fn reshare_invalidates_cached_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"version one").await.unwrap();

        let shared = SharedFiles::new();
        shared.share("a.bin", path.clone());
        let before = shared.checksum_of("a.bin", &path).await.unwrap();

        tokio::fs::write(&path, b"version two, longer").await.unwrap();
        shared.share("a.bin", path.clone());
        let after = shared.checksum_of("a.bin", &path).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn range_checksum_covers_only_the_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let full = checksum_range(&path, 0, 8).await.unwrap();
        let prefix = checksum_range(&path, 0, 4).await.unwrap();
        let middle = checksum_range(&path, 2, 4).await.unwrap();
        assert_ne!(full, prefix);
        assert_ne!(prefix, middle);

        let mut hasher = Sha256::new();
        hasher.update(b"cdef");
        assert_eq!(middle, hex::encode(hasher.finalize()));
    }

    #[tokio::test]
    async fn unshare_removes_file_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"x").await.unwrap();

        let shared = SharedFiles::new();
        shared.share("a.bin", path.clone());
        assert!(shared.path_of("a.bin").is_some());

        shared.unshare("a.bin");
        assert!(shared.path_of("a.bin").is_none());
        assert!(shared.list().is_empty());
    }
}
