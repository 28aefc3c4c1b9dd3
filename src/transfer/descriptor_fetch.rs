//! Torrent descriptor fetch
//!
//! Pulls the portable descriptor of a network torrent from one of its owners
//! in `TORRENT_FILE` chunks. If the owner dies mid-transfer the job moves to
//! another owner instead of giving up.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::catalog_sync::propagate_catalog;
use super::{chunk, IdleVerdict, Job, TransferState, UnitTracker};
use crate::context::{adopt_torrent, SwarmContext};
use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::message::{Envelope, Message};

pub struct DescriptorFetchJob {
    torrent: String,
    source: Option<IpAddr>,
    destination: PathBuf,
    tracker: UnitTracker,
    chunks: BTreeMap<u32, Bytes>,
    state: TransferState,
}

impl DescriptorFetchJob {
    pub fn new(
        torrent: impl Into<String>,
        source: IpAddr,
        destination: impl Into<PathBuf>,
        total: u32,
        max_idle_periods: u32,
    ) -> Self {
        Self {
            torrent: torrent.into(),
            source: Some(source),
            destination: destination.into(),
            tracker: UnitTracker::new(total, max_idle_periods),
            chunks: BTreeMap::new(),
            state: TransferState::Idle,
        }
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Switch to another owner; the next tick asks it for everything missing
    pub fn retarget(&mut self, source: IpAddr) {
        self.source = Some(source);
        if !self.state.is_terminal() {
            self.state = TransferState::Idle;
        }
    }

    /// The source is gone and nobody else is known to hold the torrent
    pub fn detach(&mut self) {
        self.source = None;
    }

    /// Buffer one chunk. Portable descriptors are identical on every owner,
    /// so chunks are taken from anyone.
    pub fn accept(&mut self, piece: u32, data: Bytes) -> bool {
        self.tracker.offer(piece, data)
    }

    async fn request_missing(&self, ctx: &SwarmContext, source: IpAddr) {
        for piece in self.tracker.missing() {
            let request = Message::TorrentRequest {
                torrent: self.torrent.clone(),
                piece,
            };
            ctx.transport.unicast(&request, source, None).await;
        }
    }

    /// Make sure the source is still alive, picking another owner if not
    fn check_source(&mut self, ctx: &SwarmContext) {
        let alive = self.source.map_or(false, |peer| ctx.liveness.is_alive(peer));
        if alive {
            return;
        }
        if let Some(next) = ctx.catalog.pick_owner(&self.torrent, self.source) {
            if ctx.liveness.is_alive(next) {
                tracing::info!("Fetching '{}' from {} instead", self.torrent, next);
                self.retarget(next);
                return;
            }
        }
        self.source = None;
    }

    async fn complete(&mut self, ctx: &Arc<SwarmContext>) -> TransferState {
        let mut bytes = Vec::new();
        for piece in self.chunks.values() {
            bytes.extend_from_slice(piece);
        }

        let id = match ctx.storage.register_descriptor(&bytes, &self.destination).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Fetched descriptor of '{}' is unusable: {}", self.torrent, e);
                return TransferState::Abandoned;
            }
        };

        tracing::info!("Fetched descriptor of '{}' into {}", id, self.destination.display());
        if let Err(e) = adopt_torrent(ctx, &id).await {
            tracing::warn!("Failed to scan '{}': {}", id, e);
        }
        if let Err(e) = propagate_catalog(ctx).await {
            tracing::warn!("Catalog propagation failed: {}", e);
        }
        TransferState::Done
    }
}

#[async_trait]
impl Job for DescriptorFetchJob {
    async fn tick(&mut self, ctx: &Arc<SwarmContext>) -> TransferState {
        if self.state.is_terminal() {
            return self.state;
        }

        for (index, data) in self.tracker.take_pending() {
            if self.tracker.mark_acquired(index) {
                self.chunks.insert(index, data);
            }
        }

        if self.tracker.have_all() {
            self.state = self.complete(ctx).await;
            return self.state;
        }

        self.check_source(ctx);

        if self.state == TransferState::Idle {
            if let Some(source) = self.source {
                self.request_missing(ctx, source).await;
                self.state = TransferState::Requesting;
                return self.state;
            }
        }

        self.state = match self.tracker.end_tick() {
            IdleVerdict::Active => TransferState::Receiving,
            IdleVerdict::Wait => TransferState::Requesting,
            IdleVerdict::Rerequest => {
                if let (Some(source), Some(piece)) = (self.source, self.tracker.first_missing()) {
                    let request = Message::TorrentRequest {
                        torrent: self.torrent.clone(),
                        piece,
                    };
                    ctx.transport.unicast(&request, source, None).await;
                }
                TransferState::Requesting
            }
            IdleVerdict::Abandon => {
                tracing::info!("Gave up fetching descriptor of '{}'", self.torrent);
                TransferState::Abandoned
            }
        };
        self.state
    }
}

/// Start fetching a network torrent's descriptor into `destination`.
///
/// Returns false if a fetch for the torrent is already running.
pub fn start(ctx: &SwarmContext, torrent: &str, destination: PathBuf) -> Result<bool> {
    let remote = ctx
        .catalog
        .get(torrent)
        .ok_or_else(|| SwarmError::NotFound(format!("torrent '{}' is not on the network", torrent)))?;
    let source = ctx.catalog.pick_owner(torrent, Some(ctx.me)).ok_or_else(|| {
        SwarmError::protocol(
            ProtocolErrorKind::UnknownTorrent,
            format!("no live owner of '{}'", torrent),
        )
    })?;

    let total = remote
        .descriptor_len
        .div_ceil(ctx.config.unit_size as u64)
        .max(1);
    let total = u32::try_from(total)
        .ok()
        .filter(|total| *total <= ctx.config.max_resource_units)
        .ok_or_else(|| {
            SwarmError::protocol(
                ProtocolErrorKind::InvalidDescriptor,
                format!(
                    "descriptor of '{}' is advertised at {} bytes, over the {} chunk limit",
                    torrent, remote.descriptor_len, ctx.config.max_resource_units
                ),
            )
        })?;
    let (_, created) = ctx.descriptor_jobs.get_or_insert_with(torrent.to_string(), || {
        DescriptorFetchJob::new(torrent, source, destination, total, ctx.config.max_idle_periods)
    });

    if created {
        tracing::info!("Fetching descriptor of '{}' from {} ({} chunks)", torrent, source, total);
    }
    Ok(created)
}

/// Route a `TORRENT_FILE` chunk to the running fetch, if any
pub async fn handle_torrent_file(ctx: &SwarmContext, torrent: &str, piece: u32, data: Bytes) {
    match ctx.descriptor_jobs.get(&torrent.to_string()) {
        Some(job) => {
            job.lock().await.accept(piece, data);
        }
        None => tracing::debug!("Unsolicited descriptor chunk {} of '{}'", piece, torrent),
    }
}

/// Answer a `TORRENT_REQUEST` with one chunk of our portable descriptor.
/// Unknown torrents get no answer.
pub async fn respond_torrent_request(
    ctx: &SwarmContext,
    envelope: &Envelope,
    torrent: &str,
    piece: u32,
) {
    let descriptor = match ctx.storage.descriptor_bytes(torrent).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Ignoring request for '{}': {}", torrent, e);
            return;
        }
    };

    if let Some(data) = chunk(&descriptor, piece, ctx.config.unit_size) {
        let reply = Message::TorrentFile {
            torrent: torrent.to_string(),
            piece,
            data,
        };
        ctx.transport
            .unicast(&reply, envelope.sender, Some(envelope.port))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::config::SwarmConfig;
    use crate::message::MessageKind;
    use crate::storage::{MemoryStorage, Storage};
    use crate::transfer::{chunk_count, tick_once};
    use crate::transport::{Destination, RecordingTransport};

    const UNIT: usize = 16;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Fixture {
        ctx: Arc<SwarmContext>,
        transport: Arc<RecordingTransport>,
        storage: Arc<MemoryStorage>,
        descriptor: Bytes,
    }

    /// A leecher that knows `owners` advertise torrent "t"
    fn fixture(owners: &[&str]) -> Fixture {
        let seeder = MemoryStorage::new(UNIT);
        let descriptor = Bytes::from(
            seeder
                .add_torrent("t", &[("a.bin", b"0123456789abcdefXYZ")])
                .portable_text(),
        );

        let transport = Arc::new(RecordingTransport::default());
        let storage = Arc::new(MemoryStorage::new(UNIT));
        let config = SwarmConfig::default().unit_size(UNIT);
        let ctx = SwarmContext::new(config, ip("10.0.0.1"), transport.clone(), storage.clone());

        let entry = CatalogEntry {
            id: "t".into(),
            descriptor_len: descriptor.len() as u64,
            files: vec!["a.bin".into()],
        };
        for owner in owners {
            ctx.liveness.ensure(ip(owner));
            ctx.catalog.merge(std::slice::from_ref(&entry), ip(owner));
        }

        Fixture {
            ctx,
            transport,
            storage,
            descriptor,
        }
    }

    #[tokio::test]
    async fn test_fetch_requests_all_then_registers() {
        let f = fixture(&["10.0.0.2"]);
        assert!(start(&f.ctx, "t", PathBuf::from("/dl")).unwrap());
        assert!(!start(&f.ctx, "t", PathBuf::from("/dl")).unwrap());

        tick_once(&f.ctx, &f.ctx.descriptor_jobs).await;
        let total = chunk_count(f.descriptor.len(), UNIT);
        let requests = f.transport.of_kind(MessageKind::TorrentRequest);
        assert_eq!(requests.len() as u32, total);
        assert!(requests
            .iter()
            .all(|s| s.destination == Destination::Unicast(ip("10.0.0.2"), 6789)));

        for piece in (0..total).rev() {
            handle_torrent_file(&f.ctx, "t", piece, chunk(&f.descriptor, piece, UNIT).unwrap()).await;
        }
        let retired = tick_once(&f.ctx, &f.ctx.descriptor_jobs).await;
        assert_eq!(retired, vec![("t".to_string(), TransferState::Done)]);

        assert!(f.storage.has_torrent("t").await);
        assert!(f.ctx.ownership.is_tracked("t"));
        // Propagated our new catalog
        assert!(!f.transport.of_kind(MessageKind::ListResponse).is_empty());
    }

    #[tokio::test]
    async fn test_dead_source_retargeted() {
        let f = fixture(&["10.0.0.2", "10.0.0.3"]);
        start(&f.ctx, "t", PathBuf::from("/dl")).unwrap();
        tick_once(&f.ctx, &f.ctx.descriptor_jobs).await;

        let first = f.ctx.descriptor_jobs.get(&"t".to_string()).unwrap().lock().await.source().unwrap();
        let other = if first == ip("10.0.0.2") { ip("10.0.0.3") } else { ip("10.0.0.2") };
        f.transport.take();

        f.ctx.forget_peer(first).await;
        let job = f.ctx.descriptor_jobs.get(&"t".to_string()).unwrap();
        assert_eq!(job.lock().await.source(), Some(other));

        tick_once(&f.ctx, &f.ctx.descriptor_jobs).await;
        let requests = f.transport.of_kind(MessageKind::TorrentRequest);
        assert!(!requests.is_empty());
        assert!(requests
            .iter()
            .all(|s| s.destination == Destination::Unicast(other, 6789)));
    }

    #[tokio::test]
    async fn test_no_owner_left_abandons() {
        let f = fixture(&["10.0.0.2"]);
        start(&f.ctx, "t", PathBuf::from("/dl")).unwrap();
        tick_once(&f.ctx, &f.ctx.descriptor_jobs).await;

        f.ctx.forget_peer(ip("10.0.0.2")).await;
        f.transport.take();

        let mut retired = Vec::new();
        for _ in 0..6 {
            retired.extend(tick_once(&f.ctx, &f.ctx.descriptor_jobs).await);
        }
        assert_eq!(retired, vec![("t".to_string(), TransferState::Abandoned)]);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_descriptor_refused() {
        let f = fixture(&[]);
        let owner = ip("10.0.0.2");
        f.ctx.liveness.ensure(owner);
        for (id, len) in [("big", u64::MAX), ("over", (UNIT as u64) * 4096 + 1)] {
            let entry = CatalogEntry {
                id: id.into(),
                descriptor_len: len,
                files: vec!["a.bin".into()],
            };
            f.ctx.catalog.merge(&[entry], owner);
            let err = start(&f.ctx, id, PathBuf::from("/dl")).unwrap_err();
            assert!(matches!(
                err,
                SwarmError::Protocol {
                    kind: ProtocolErrorKind::InvalidDescriptor,
                    ..
                }
            ));
        }
        assert!(f.ctx.descriptor_jobs.is_empty());
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_start_unknown_torrent() {
        let f = fixture(&[]);
        assert!(matches!(
            start(&f.ctx, "t", PathBuf::from("/dl")),
            Err(SwarmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_respond_torrent_request() {
        let f = fixture(&[]);
        let local = MemoryStorage::new(UNIT);
        local.add_torrent("mine", &[("x", b"hello")]);
        let ctx = SwarmContext::new(
            SwarmConfig::default().unit_size(UNIT),
            ip("10.0.0.1"),
            f.transport.clone(),
            Arc::new(local),
        );

        let peer = ip("10.0.0.9");
        let envelope = Envelope::new(Message::Hello, peer, 7000);
        respond_torrent_request(&ctx, &envelope, "mine", 0).await;
        respond_torrent_request(&ctx, &envelope, "other", 0).await;
        respond_torrent_request(&ctx, &envelope, "mine", 99).await;

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Destination::Unicast(peer, 7000));
        assert_eq!(sent[0].message.kind(), MessageKind::TorrentFile);
    }
}
