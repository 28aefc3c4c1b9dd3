//! # lanswarm
//!
//! Peer-to-peer file distribution for a local network, spoken over UDP.
//!
//! ## Features
//!
//! - **Serverless discovery**: peers find each other through multicast heartbeats
//! - **Catalog exchange**: every peer advertises the torrents it holds
//! - **Rarest-first transfer**: pieces are requested least-owned first, each from a random owner
//! - **Integrity**: every piece is checked against its SHA-1 before it is stored or re-shared
//! - **Async**: built on Tokio; one receive loop per socket and one reaper per transfer kind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanswarm::{SwarmConfig, SwarmEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SwarmEngine::start(SwarmConfig::default()).await?;
//!
//!     // Share a directory with the LAN
//!     engine.publish_new_local_resource("photos", &["./photos".into()]).await?;
//!
//!     // See what others are sharing
//!     for (id, torrent) in engine.request_catalog_listing() {
//!         println!("{} ({} files)", id, torrent.files.len());
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

// Modules
pub mod catalog;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod message;
pub mod ownership;
pub mod probe;
pub mod storage;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use catalog::{CatalogEntry, NetworkCatalog, RemoteTorrent};
pub use config::SwarmConfig;
pub use context::SwarmContext;
pub use descriptor::TorrentDescriptor;
pub use engine::{DownloadProgress, SwarmEngine};
pub use error::{NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind, SwarmError};
pub use liveness::{CatalogState, PeerPhase, SeederStatus};
pub use message::{Envelope, Message, MessageKind, PieceRef};
pub use ownership::OwnershipDirectory;
pub use transfer::TransferState;

// Storage exports
pub use storage::{FsStorage, MemoryStorage, Storage};

// Transport exports
pub use transport::{RecordingTransport, Transport, UdpTransport};
