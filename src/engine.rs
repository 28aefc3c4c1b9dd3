//! Swarm Engine - Main coordinator
//!
//! The `SwarmEngine` is the primary entry point for the library. It binds the
//! sockets, registers the torrents found on disk and runs the background
//! loops: heartbeat, one receive loop per socket and one reaper per transfer
//! kind. Operator commands go through its methods.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::catalog::{CatalogEntry, RemoteTorrent};
use crate::config::SwarmConfig;
use crate::context::{self, FileKey, SwarmContext};
use crate::dispatch;
use crate::error::{Result, SwarmError};
use crate::liveness::{self, SeederStatus};
use crate::storage::{FsStorage, Storage};
use crate::transfer::catalog_sync::{self, CatalogSyncJob};
use crate::transfer::descriptor_fetch::{self, DescriptorFetchJob};
use crate::transfer::download::{self, DownloadJob};
use crate::transfer::upload::UploadJob;
use crate::transfer::{run_reaper, JobTable};
use crate::transport::{Channel, Transport, UdpTransport};

/// How long shutdown waits for each background task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Progress of one running file download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub torrent: String,
    pub file: String,
    pub acquired: u32,
    pub total: u32,
}

/// The main swarm engine
pub struct SwarmEngine {
    ctx: Arc<SwarmContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SwarmEngine {
    /// Start a peer, loading every descriptor kept in `torrents_dir`
    pub async fn start(config: SwarmConfig) -> Result<Self> {
        Self::start_with_descriptors(config, &[]).await
    }

    /// Start a peer. When `descriptors` is non-empty only those descriptor
    /// files are loaded instead of the contents of `torrents_dir`.
    pub async fn start_with_descriptors(config: SwarmConfig, descriptors: &[PathBuf]) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(UdpTransport::bind(&config).await?);
        let storage = Arc::new(FsStorage::new(&config.torrents_dir, config.unit_size).await?);

        let ids = if descriptors.is_empty() {
            storage.load_local().await?
        } else {
            let mut ids = Vec::new();
            for path in descriptors {
                match storage.load_descriptor(path).await {
                    Ok(id) => ids.push(id),
                    Err(e) => tracing::warn!("Skipping descriptor {}: {}", path.display(), e),
                }
            }
            ids
        };

        let me = transport.local_ip();
        let engine = Self::with_parts(config, me, transport.clone(), storage);
        for id in &ids {
            if let Err(e) = context::adopt_torrent(&engine.ctx, id).await {
                tracing::warn!("Cannot register '{}': {}", id, e);
            }
        }

        engine.spawn_background(transport);

        if let Err(e) = catalog_sync::propagate_catalog(&engine.ctx).await {
            tracing::warn!("Cannot propagate catalog: {}", e);
        }

        Ok(engine)
    }

    /// Build an engine over explicit collaborators without starting any
    /// background task. Jobs are then driven by the caller.
    pub fn with_parts(
        config: SwarmConfig,
        me: IpAddr,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            ctx: SwarmContext::new(config, me, transport, storage),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn_background(&self, transport: Arc<UdpTransport>) {
        let ctx = &self.ctx;
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(liveness::run_heartbeat(Arc::clone(ctx))));
        for channel in [Channel::Multicast, Channel::Unicast] {
            tasks.push(tokio::spawn(dispatch::run_receive_loop(
                Arc::clone(ctx),
                Arc::clone(&transport),
                channel,
            )));
        }

        tasks.push(tokio::spawn(run_reaper(Arc::clone(ctx), "catalog", catalog_jobs)));
        tasks.push(tokio::spawn(run_reaper(Arc::clone(ctx), "descriptor", descriptor_jobs)));
        tasks.push(tokio::spawn(run_reaper(Arc::clone(ctx), "download", downloads)));
        tasks.push(tokio::spawn(run_reaper(Arc::clone(ctx), "upload", uploads)));
    }

    /// Shared state, for components driven outside the engine
    pub fn context(&self) -> &Arc<SwarmContext> {
        &self.ctx
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.ctx.config
    }

    /// Our own address on the LAN
    pub fn local_ip(&self) -> IpAddr {
        self.ctx.me
    }

    /// Torrents other peers have advertised, sorted by ID
    pub fn request_catalog_listing(&self) -> Vec<(String, RemoteTorrent)> {
        self.ctx.catalog.snapshot()
    }

    /// Fetch the descriptor of a network torrent. Files will be rooted at
    /// `destination`, or at the configured download directory.
    ///
    /// Returns false if the fetch was already running.
    pub async fn request_resource(&self, id: &str, destination: Option<PathBuf>) -> Result<bool> {
        self.ensure_running()?;
        if self.ctx.storage.has_torrent(id).await {
            return Err(SwarmError::invalid_input(
                "id",
                format!("torrent '{}' is already held locally", id),
            ));
        }
        let destination = destination.unwrap_or_else(|| self.ctx.config.download_dir.clone());
        descriptor_fetch::start(&self.ctx, id, destination)
    }

    /// Download every missing piece of one file, or of every file of the
    /// torrent when `file` is `None`. Returns the number of downloads started.
    pub async fn start_download(&self, id: &str, file: Option<&str>) -> Result<usize> {
        self.ensure_running()?;
        download::start(&self.ctx, id, file).await
    }

    /// Build a descriptor for local `paths`, share it and announce it.
    /// Returns the number of pieces now offered.
    pub async fn publish_new_local_resource(&self, id: &str, paths: &[PathBuf]) -> Result<usize> {
        self.ensure_running()?;
        if paths.is_empty() {
            return Err(SwarmError::invalid_input("paths", "nothing to publish"));
        }
        if self.ctx.storage.has_torrent(id).await {
            return Err(SwarmError::invalid_input(
                "id",
                format!("torrent '{}' already exists", id),
            ));
        }

        self.ctx.storage.publish(id, paths).await?;
        let pieces = context::adopt_torrent(&self.ctx, id).await?;
        catalog_sync::propagate_catalog(&self.ctx).await?;
        Ok(pieces)
    }

    /// Torrents held locally
    pub async fn local_catalog(&self) -> Result<Vec<CatalogEntry>> {
        self.ctx.storage.local_catalog().await
    }

    /// Relative paths of a torrent's files, local or advertised
    pub async fn torrent_files(&self, id: &str) -> Result<Vec<String>> {
        if self.ctx.storage.has_torrent(id).await {
            let files = self.ctx.storage.files(id).await?;
            return Ok(files.into_iter().map(|(path, _)| path).collect());
        }
        self.ctx
            .catalog
            .get(id)
            .map(|remote| remote.files)
            .ok_or_else(|| SwarmError::NotFound(format!("torrent '{}'", id)))
    }

    /// Known peers and their liveness state
    pub fn peers(&self) -> Vec<(IpAddr, SeederStatus)> {
        self.ctx.liveness.peers()
    }

    /// Running file downloads
    pub async fn downloads(&self) -> Vec<DownloadProgress> {
        let mut progress = Vec::new();
        for ((torrent, file), job) in self.ctx.downloads.snapshot() {
            let job = job.lock().await;
            progress.push(DownloadProgress {
                torrent,
                file,
                acquired: job.acquired(),
                total: job.total(),
            });
        }
        progress.sort_by(|a, b| (&a.torrent, &a.file).cmp(&(&b.torrent, &b.file)));
        progress
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SwarmError::Shutdown)
        }
    }

    /// Graceful shutdown: stop producing work and let running ticks finish
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
        tracing::info!("Peer {} stopped", self.ctx.me);
    }
}

impl Drop for SwarmEngine {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

fn catalog_jobs(ctx: &SwarmContext) -> &JobTable<IpAddr, CatalogSyncJob> {
    &ctx.catalog_jobs
}

fn descriptor_jobs(ctx: &SwarmContext) -> &JobTable<String, DescriptorFetchJob> {
    &ctx.descriptor_jobs
}

fn downloads(ctx: &SwarmContext) -> &JobTable<FileKey, DownloadJob> {
    &ctx.downloads
}

fn uploads(ctx: &SwarmContext) -> &JobTable<IpAddr, UploadJob> {
    &ctx.uploads
}
