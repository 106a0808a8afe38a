//! Peer node: serves shared files to other peers and downloads with
//! verification, heartbeating the tracker in the background.

mod download;
mod node;
mod transfer;

pub use download::Downloader;
pub use node::{PeerConfig, PeerError, PeerNode, SERVICE_TYPE};
pub use transfer::{checksum_range, SharedFiles};
