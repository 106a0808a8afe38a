#![forbid(unsafe_code)]

//! # filemesh
//!
//! A peer-to-peer file-sharing overlay built from three cooperating roles:
//!
//! - **Tracker** — the registry of currently-live peers, with TTL liveness
//! - **Index server** — the persistent map from file names to the peers
//!   holding them, with glob-style search
//! - **Peer nodes** — file holders that serve raw byte streams and download
//!   with checksum verification
//!
//! All roles share a service-discovery substrate (in-process or UDP gossip),
//! a JSON message protocol with a dispatch runtime, and a set of resilience
//! primitives (retry with backoff and jitter, circuit breakers, connection
//! pooling, TTL caching, bounded task pools). A dependency-ordered bootstrap
//! orchestrator with cycle detection starts and stops everything.
//!
//! ## Quick start
//!
//! ```no_run
//! use filemesh::bootstrap::Context;
//! use filemesh::config::ConfigStore;
//! use filemesh::tracker::{TrackerConfig, TrackerServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = Context::new(Arc::new(ConfigStore::new()));
//!     let tracker = TrackerServer::new(
//!         TrackerConfig::from_config(&context.config),
//!         context.health.clone(),
//!         context.metrics.clone(),
//!         context.registry.clone(),
//!     );
//!     let addr = tracker.start(context.shutdown_token()).await?;
//!     println!("tracker on {addr}");
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod health;
pub mod index;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod resilience;
pub mod shutdown;
pub mod tracker;

pub mod prelude;
