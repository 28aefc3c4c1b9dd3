//! Process-scoped swarm state
//!
//! One [`SwarmContext`] is built at startup and shared (behind an `Arc`) by
//! the receive loops, the heartbeat task, the reapers and the public API.

use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::NetworkCatalog;
use crate::config::SwarmConfig;
use crate::error::Result;
use crate::liveness::Liveness;
use crate::message::Message;
use crate::ownership::OwnershipDirectory;
use crate::probe;
use crate::storage::Storage;
use crate::transfer::catalog_sync::CatalogSyncJob;
use crate::transfer::descriptor_fetch::DescriptorFetchJob;
use crate::transfer::download::DownloadJob;
use crate::transfer::upload::UploadJob;
use crate::transfer::JobTable;
use crate::transport::Transport;

/// Key of a download job: torrent ID and relative file path
pub type FileKey = (String, String);

pub struct SwarmContext {
    pub config: SwarmConfig,
    /// Our own address; messages from it are ignored
    pub me: IpAddr,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub liveness: Liveness,
    pub ownership: OwnershipDirectory,
    pub catalog: NetworkCatalog,
    /// Catalog sync jobs, by sending peer
    pub catalog_jobs: JobTable<IpAddr, CatalogSyncJob>,
    /// Descriptor fetches, by torrent ID
    pub descriptor_jobs: JobTable<String, DescriptorFetchJob>,
    /// Piece downloads, by torrent and file
    pub downloads: JobTable<FileKey, DownloadJob>,
    /// Piece uploads, by requesting peer
    pub uploads: JobTable<IpAddr, UploadJob>,
    /// Process-wide running flag
    pub shutdown: CancellationToken,
}

impl SwarmContext {
    pub fn new(
        config: SwarmConfig,
        me: IpAddr,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            liveness: Liveness::new(me, config.dead_after_missed),
            config,
            me,
            transport,
            storage,
            ownership: OwnershipDirectory::new(),
            catalog: NetworkCatalog::new(),
            catalog_jobs: JobTable::new(),
            descriptor_jobs: JobTable::new(),
            downloads: JobTable::new(),
            uploads: JobTable::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Drop every trace of a dead peer.
    ///
    /// Ownership and catalog entries go first so no new job can pick the
    /// peer; then jobs addressed to it are retired or re-targeted, each under
    /// its own lock.
    pub async fn forget_peer(&self, peer: IpAddr) {
        self.ownership.remove_peer(peer);
        self.catalog.remove_owner(peer);

        if self.catalog_jobs.remove(&peer).is_some() {
            tracing::debug!("Dropped catalog sync with {}", peer);
        }
        if self.uploads.remove(&peer).is_some() {
            tracing::debug!("Dropped uploads to {}", peer);
        }

        for (torrent, job) in self.descriptor_jobs.snapshot() {
            let mut job = job.lock().await;
            if job.source() == Some(peer) {
                match self.catalog.pick_owner(&torrent, Some(peer)) {
                    Some(next) => {
                        tracing::info!(
                            "Descriptor source {} for '{}' died, switching to {}",
                            peer,
                            torrent,
                            next
                        );
                        job.retarget(next);
                    }
                    None => {
                        tracing::info!(
                            "Descriptor source {} for '{}' died, waiting for another owner",
                            peer,
                            torrent
                        );
                        job.detach();
                    }
                }
            }
        }
    }
}

/// Make a locally held torrent known to the swarm: track its pieces, claim
/// and announce the ones already on disk, then look for other owners.
///
/// Returns the number of pieces found locally.
pub async fn adopt_torrent(ctx: &Arc<SwarmContext>, torrent: &str) -> Result<usize> {
    let files = ctx.storage.files(torrent).await?;
    ctx.ownership.track_torrent(torrent, &files);

    let held = ctx.storage.verified_pieces(torrent).await?;
    for piece in &held {
        ctx.ownership.add_owner(piece, ctx.me);
        ctx.transport.multicast(&Message::IHave(piece.clone())).await;
    }

    let total: u32 = files.iter().map(|(_, pieces)| pieces).sum();
    tracing::info!("Sharing '{}': {}/{} pieces held", torrent, held.len(), total);

    probe::spawn(ctx.clone(), torrent.to_string(), None);
    Ok(held.len())
}
