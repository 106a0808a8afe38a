//! Message taxonomy for the tracker, index server, and peer protocols
//!
//! One internally-tagged enum covers every wire message; each variant
//! validates its own required fields on both the encode and decode paths.

use crate::protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default chunk size declared in FileTransferStart.
pub const TRANSFER_CHUNK_SIZE: u32 = 8192;

/// A live peer as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    pub last_seen_millis: u64,
}

/// A peer holding a file, as reported by the index server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
}

impl PeerRef {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Tracker
    RegisterRequest {
        peer_id: String,
        host: String,
        port: u16,
    },
    RegisterResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    DeregisterRequest {
        peer_id: String,
    },
    DeregisterResponse {
        success: bool,
    },
    DiscoverRequest,
    DiscoverResponse {
        peers: Vec<PeerInfo>,
    },
    IsAliveRequest {
        peer_id: String,
    },
    IsAliveResponse {
        alive: bool,
    },

    // Index server
    RegisterFileRequest {
        file_name: String,
        peer_id: String,
        host: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    RegisterFileResponse {
        success: bool,
    },
    UnregisterFileRequest {
        file_name: String,
        peer_id: String,
    },
    UnregisterFileResponse {
        success: bool,
    },
    GetPeersWithFileRequest {
        file_name: String,
    },
    GetPeersWithFileResponse {
        file_name: String,
        peers: Vec<PeerRef>,
    },
    SearchFilesRequest {
        pattern: String,
        max_results: usize,
    },
    SearchFilesResponse {
        results: HashMap<String, Vec<PeerRef>>,
    },

    // Peer-to-peer file transfer
    FileRequest {
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<u64>,
    },
    FileResponse {
        file_name: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
    },
    FileTransferStart {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        checksum: String,
        chunk_size: u32,
    },
    FileTransferComplete {
        transfer_id: String,
        success: bool,
        bytes_transferred: u64,
    },
    FileTransferError {
        transfer_id: String,
        code: ErrorCode,
        message: String,
    },
    Ping,
    Pong,

    // Liveness and failures
    Heartbeat {
        peer_id: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// A message that failed its field validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message: {reason}")]
pub struct InvalidMessage {
    pub reason: String,
}

fn required(field: &str, value: &str) -> Result<(), InvalidMessage> {
    if value.trim().is_empty() {
        return Err(InvalidMessage { reason: format!("{field} must not be empty") });
    }
    Ok(())
}

fn valid_port(port: u16) -> Result<(), InvalidMessage> {
    // u16 caps the top of the range; zero is the only representable bad value
    if port == 0 {
        return Err(InvalidMessage { reason: "port must be in [1, 65535]".to_string() });
    }
    Ok(())
}

impl Message {
    /// The wire tag for this variant, matching the serde representation.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterRequest { .. } => "register_request",
            Message::RegisterResponse { .. } => "register_response",
            Message::DeregisterRequest { .. } => "deregister_request",
            Message::DeregisterResponse { .. } => "deregister_response",
            Message::DiscoverRequest => "discover_request",
            Message::DiscoverResponse { .. } => "discover_response",
            Message::IsAliveRequest { .. } => "is_alive_request",
            Message::IsAliveResponse { .. } => "is_alive_response",
            Message::RegisterFileRequest { .. } => "register_file_request",
            Message::RegisterFileResponse { .. } => "register_file_response",
            Message::UnregisterFileRequest { .. } => "unregister_file_request",
            Message::UnregisterFileResponse { .. } => "unregister_file_response",
            Message::GetPeersWithFileRequest { .. } => "get_peers_with_file_request",
            Message::GetPeersWithFileResponse { .. } => "get_peers_with_file_response",
            Message::SearchFilesRequest { .. } => "search_files_request",
            Message::SearchFilesResponse { .. } => "search_files_response",
            Message::FileRequest { .. } => "file_request",
            Message::FileResponse { .. } => "file_response",
            Message::FileTransferStart { .. } => "file_transfer_start",
            Message::FileTransferComplete { .. } => "file_transfer_complete",
            Message::FileTransferError { .. } => "file_transfer_error",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Error { .. } => "error",
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::RegisterResponse { .. }
                | Message::DeregisterResponse { .. }
                | Message::DiscoverResponse { .. }
                | Message::IsAliveResponse { .. }
                | Message::RegisterFileResponse { .. }
                | Message::UnregisterFileResponse { .. }
                | Message::GetPeersWithFileResponse { .. }
                | Message::SearchFilesResponse { .. }
                | Message::FileResponse { .. }
                | Message::Pong
                | Message::Error { .. }
        )
    }

    /// Check variant-specific required fields and ranges.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        match self {
            Message::RegisterRequest { peer_id, host, port } => {
                required("peer_id", peer_id)?;
                required("host", host)?;
                valid_port(*port)
            }
            Message::DeregisterRequest { peer_id }
            | Message::IsAliveRequest { peer_id }
            | Message::Heartbeat { peer_id } => required("peer_id", peer_id),
            Message::RegisterFileRequest { file_name, peer_id, host, port, .. } => {
                required("file_name", file_name)?;
                required("peer_id", peer_id)?;
                required("host", host)?;
                valid_port(*port)
            }
            Message::UnregisterFileRequest { file_name, peer_id } => {
                required("file_name", file_name)?;
                required("peer_id", peer_id)
            }
            Message::GetPeersWithFileRequest { file_name } => required("file_name", file_name),
            Message::SearchFilesRequest { pattern, max_results } => {
                required("pattern", pattern)?;
                if *max_results == 0 {
                    return Err(InvalidMessage {
                        reason: "max_results must be positive".to_string(),
                    });
                }
                Ok(())
            }
            Message::FileRequest { file_name, .. } => required("file_name", file_name),
            Message::FileTransferStart { transfer_id, file_name, checksum, chunk_size, .. } => {
                required("transfer_id", transfer_id)?;
                required("file_name", file_name)?;
                required("checksum", checksum)?;
                if *chunk_size == 0 {
                    return Err(InvalidMessage {
                        reason: "chunk_size must be positive".to_string(),
                    });
                }
                Ok(())
            }
            Message::FileTransferComplete { transfer_id, .. }
            | Message::FileTransferError { transfer_id, .. } => {
                required("transfer_id", transfer_id)
            }
            Message::DiscoverResponse { peers } => {
                for peer in peers {
                    required("peer_id", &peer.peer_id)?;
                    valid_port(peer.port)?;
                }
                Ok(())
            }
            Message::GetPeersWithFileResponse { file_name, peers } => {
                required("file_name", file_name)?;
                for peer in peers {
                    required("peer_id", &peer.peer_id)?;
                    valid_port(peer.port)?;
                }
                Ok(())
            }
            Message::Error { message, .. } => required("message", message),
            _ => Ok(()),
        }
    }
}
