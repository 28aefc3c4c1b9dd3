//! Piece download
//!
//! One job per file being fetched. Pieces are requested rarest first, each
//! from a random known owner, at most `max_in_flight` per batch. Every piece
//! is hash-checked before it is written; a bad piece simply stays missing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{IdleVerdict, Job, TransferState, UnitTracker};
use crate::context::SwarmContext;
use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::message::{Envelope, Message, PieceRef};

pub struct DownloadJob {
    torrent: String,
    file: String,
    tracker: UnitTracker,
    /// Pieces asked for in the last batch
    outstanding: HashSet<u32>,
    state: TransferState,
}

impl DownloadJob {
    pub fn new(torrent: impl Into<String>, file: impl Into<String>, pieces: u32, max_idle_periods: u32) -> Self {
        Self {
            torrent: torrent.into(),
            file: file.into(),
            tracker: UnitTracker::new(pieces, max_idle_periods),
            outstanding: HashSet::new(),
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn acquired(&self) -> u32 {
        self.tracker.acquired_count()
    }

    pub fn total(&self) -> u32 {
        self.tracker.total()
    }

    /// Buffer an arriving piece
    pub fn accept(&mut self, piece: u32, data: Bytes) -> bool {
        self.tracker.offer(piece, data)
    }

    fn piece(&self, index: u32) -> PieceRef {
        PieceRef::new(self.torrent.clone(), self.file.clone(), index)
    }

    /// Request missing pieces, rarest first, each from a random owner.
    /// Pieces nobody is known to hold are skipped until a probe finds one.
    async fn request_batch(&mut self, ctx: &SwarmContext) -> usize {
        self.outstanding.clear();
        let order = ctx.ownership.rarity_order(&self.torrent, &self.file);

        for index in order {
            if self.outstanding.len() >= ctx.config.max_in_flight {
                break;
            }
            if self.tracker.is_acquired(index) {
                continue;
            }
            let piece = self.piece(index);
            if let Some(owner) = ctx.ownership.pick_owner(&piece, ctx.me) {
                ctx.transport
                    .unicast(&Message::PieceRequest(piece), owner, None)
                    .await;
                self.outstanding.insert(index);
            }
        }

        tracing::debug!(
            "Requested {} pieces of {}/{} ({} missing)",
            self.outstanding.len(),
            self.torrent,
            self.file,
            self.tracker.total() - self.tracker.acquired_count()
        );
        self.outstanding.len()
    }

    /// Verify and store one piece; announce it on success
    async fn store(&mut self, ctx: &SwarmContext, index: u32, data: Bytes) {
        let piece = self.piece(index);
        if let Err(e) = verify(ctx, &piece, &data).await {
            if e.is_retryable() {
                tracing::debug!("Dropping piece {} of {}: {}", index, self.file, e);
            } else {
                tracing::warn!("Cannot verify piece {} of {}: {}", index, self.file, e);
            }
            return;
        }

        if let Err(e) = ctx.storage.write_piece(&piece, &data).await {
            tracing::warn!("Failed to write piece {} of {}: {}", index, self.file, e);
            return;
        }

        self.tracker.mark_acquired(index);
        self.outstanding.remove(&index);
        ctx.ownership.add_owner(&piece, ctx.me);
        ctx.transport.multicast(&Message::IHave(piece)).await;
    }

    async fn finish(&mut self, ctx: &SwarmContext) -> TransferState {
        if let Err(e) = ctx.storage.finish_file(&self.torrent, &self.file).await {
            tracing::warn!("Failed to finalize {}/{}: {}", self.torrent, self.file, e);
            self.abandon(ctx).await;
            return TransferState::Abandoned;
        }

        tracing::info!("Downloaded {}/{}", self.torrent, self.file);
        match ctx.storage.is_complete(&self.torrent).await {
            Ok(true) => tracing::info!("Torrent '{}' complete", self.torrent),
            Ok(false) => {}
            Err(e) => tracing::warn!("Cannot check '{}': {}", self.torrent, e),
        }
        TransferState::Done
    }

    /// Drop the partial file and the ownership claims it backed
    async fn abandon(&mut self, ctx: &SwarmContext) {
        if let Err(e) = ctx.storage.discard_file(&self.torrent, &self.file).await {
            tracing::warn!("Failed to discard {}/{}: {}", self.torrent, self.file, e);
        }
        for index in 0..self.tracker.total() {
            if self.tracker.is_acquired(index) {
                ctx.ownership.remove_owner(&self.piece(index), ctx.me);
            }
        }
    }
}

#[async_trait]
impl Job for DownloadJob {
    async fn tick(&mut self, ctx: &Arc<SwarmContext>) -> TransferState {
        if self.state.is_terminal() {
            return self.state;
        }

        for (index, data) in self.tracker.take_pending() {
            self.store(ctx, index, data).await;
        }

        if self.tracker.have_all() {
            self.state = self.finish(ctx).await;
            return self.state;
        }

        if self.state == TransferState::Idle {
            self.request_batch(ctx).await;
            self.state = TransferState::Requesting;
            return self.state;
        }

        self.state = match self.tracker.end_tick() {
            IdleVerdict::Active => {
                // Previous batch fully served; go on without waiting to idle
                if self.outstanding.is_empty() {
                    self.request_batch(ctx).await;
                }
                TransferState::Receiving
            }
            IdleVerdict::Wait => TransferState::Requesting,
            IdleVerdict::Rerequest => {
                self.request_batch(ctx).await;
                TransferState::Requesting
            }
            IdleVerdict::Abandon => {
                tracing::info!(
                    "Gave up on {}/{} with {}/{} pieces",
                    self.torrent,
                    self.file,
                    self.tracker.acquired_count(),
                    self.tracker.total()
                );
                self.abandon(ctx).await;
                TransferState::Abandoned
            }
        };
        self.state
    }
}

/// Start downloading one file of a local torrent, or all of them.
///
/// Files we already hold completely are skipped. Returns how many new jobs
/// were started.
pub async fn start(ctx: &SwarmContext, torrent: &str, file: Option<&str>) -> Result<usize> {
    let files = ctx.storage.files(torrent).await?;
    ctx.ownership.track_torrent(torrent, &files);

    let selected: Vec<_> = match file {
        Some(name) => {
            let found: Vec<_> = files.into_iter().filter(|(path, _)| path == name).collect();
            if found.is_empty() {
                return Err(SwarmError::protocol(
                    ProtocolErrorKind::UnknownFile,
                    format!("'{}' is not part of '{}'", name, torrent),
                ));
            }
            found
        }
        None => files,
    };

    let mut started = 0;
    for (path, pieces) in selected {
        let held = (0..pieces)
            .all(|index| ctx.ownership.owns(&PieceRef::new(torrent, path.clone(), index), ctx.me));
        if held {
            tracing::info!("Already holding {}/{}", torrent, path);
            continue;
        }

        let key = (torrent.to_string(), path.clone());
        let (_, created) = ctx.downloads.get_or_insert_with(key, || {
            DownloadJob::new(torrent, path.clone(), pieces, ctx.config.max_idle_periods)
        });
        if created {
            tracing::info!("Downloading {}/{} ({} pieces)", torrent, path, pieces);
            started += 1;
        }
    }
    Ok(started)
}

async fn verify(ctx: &SwarmContext, piece: &PieceRef, data: &[u8]) -> Result<()> {
    if ctx.storage.verify_piece(piece, data).await? {
        return Ok(());
    }
    Err(SwarmError::protocol(
        ProtocolErrorKind::HashMismatch,
        format!("{}/{} piece {} does not match its hash", piece.torrent, piece.file, piece.piece),
    ))
}

/// Route a `PIECE_DATA` to its download job. The sender evidently holds the
/// piece, so it is recorded as an owner either way.
pub async fn handle_piece_data(ctx: &SwarmContext, envelope: &Envelope, piece: PieceRef, data: Bytes) {
    ctx.liveness.ensure(envelope.sender);
    ctx.ownership.add_owner(&piece, envelope.sender);

    let key = (piece.torrent.clone(), piece.file.clone());
    match ctx.downloads.get(&key) {
        Some(job) => {
            job.lock().await.accept(piece.piece, data);
        }
        None => tracing::debug!("Unsolicited piece {} of {}/{}", piece.piece, piece.torrent, piece.file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::message::MessageKind;
    use crate::storage::{MemoryStorage, Storage};
    use crate::transfer::tick_once;
    use crate::transport::{Destination, RecordingTransport};
    use std::net::IpAddr;

    const UNIT: usize = 4;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Fixture {
        ctx: Arc<SwarmContext>,
        transport: Arc<RecordingTransport>,
        storage: Arc<MemoryStorage>,
    }

    /// A leecher holding the descriptor of "t" whose pieces 10.0.0.2 owns
    async fn fixture(content: &[u8]) -> Fixture {
        let seeder = MemoryStorage::new(UNIT);
        let descriptor = seeder.add_torrent("t", &[("f.bin", content)]);

        let storage = Arc::new(MemoryStorage::new(UNIT));
        storage
            .register_descriptor(descriptor.portable_text().as_bytes(), std::path::Path::new("/dl"))
            .await
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let config = SwarmConfig::default().unit_size(UNIT).max_in_flight(2);
        let ctx = SwarmContext::new(config, ip("10.0.0.1"), transport.clone(), storage.clone());
        ctx.ownership
            .track_torrent("t", &storage.files("t").await.unwrap());
        for index in 0..descriptor.files[0].piece_count() {
            ctx.ownership.add_owner(&PieceRef::new("t", "f.bin", index), ip("10.0.0.2"));
        }

        Fixture {
            ctx,
            transport,
            storage,
        }
    }

    fn piece_data(content: &[u8], index: u32) -> Bytes {
        let start = index as usize * UNIT;
        Bytes::copy_from_slice(&content[start..(start + UNIT).min(content.len())])
    }

    #[tokio::test]
    async fn test_verify_reports_hash_mismatch() {
        let content = b"aaaabbbbcc";
        let f = fixture(content).await;
        let piece = PieceRef::new("t", "f.bin", 1);

        assert!(verify(&f.ctx, &piece, &piece_data(content, 1)).await.is_ok());

        let err = verify(&f.ctx, &piece, b"xxxx").await.unwrap_err();
        assert!(matches!(
            err,
            SwarmError::Protocol {
                kind: ProtocolErrorKind::HashMismatch,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_batch_capped_and_rarest_first() {
        let f = fixture(b"aaaabbbbcc").await;
        // Piece 2 gets a second owner, so it is requested last
        f.ctx.ownership.add_owner(&PieceRef::new("t", "f.bin", 2), ip("10.0.0.3"));

        assert_eq!(start(&f.ctx, "t", None).await.unwrap(), 1);
        tick_once(&f.ctx, &f.ctx.downloads).await;

        let requested: Vec<u32> = f
            .transport
            .of_kind(MessageKind::PieceRequest)
            .iter()
            .map(|s| s.message.piece_index())
            .collect();
        assert_eq!(requested, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_out_of_order_pieces_reassembled() {
        let content = b"firstsecond!";
        let f = fixture(content).await;
        start(&f.ctx, "t", Some("f.bin")).await.unwrap();
        tick_once(&f.ctx, &f.ctx.downloads).await;

        let sender = Envelope::new(Message::Hello, ip("10.0.0.2"), 6789);
        for index in [2u32, 0, 1, 0] {
            let piece = PieceRef::new("t", "f.bin", index);
            handle_piece_data(&f.ctx, &sender, piece, piece_data(content, index)).await;
        }

        let retired = tick_once(&f.ctx, &f.ctx.downloads).await;
        assert_eq!(
            retired,
            vec![(("t".to_string(), "f.bin".to_string()), TransferState::Done)]
        );
        assert_eq!(f.storage.file_contents("t", "f.bin").unwrap(), content);
        assert_eq!(f.transport.of_kind(MessageKind::IHave).len(), 3);
        assert!(f.ctx.ownership.owns(&PieceRef::new("t", "f.bin", 1), ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_piece_missing() {
        let content = b"abcdefgh";
        let f = fixture(content).await;
        start(&f.ctx, "t", None).await.unwrap();
        tick_once(&f.ctx, &f.ctx.downloads).await;

        let sender = Envelope::new(Message::Hello, ip("10.0.0.2"), 6789);
        handle_piece_data(&f.ctx, &sender, PieceRef::new("t", "f.bin", 0), Bytes::from_static(b"zzzz")).await;
        handle_piece_data(&f.ctx, &sender, PieceRef::new("t", "f.bin", 1), piece_data(content, 1)).await;
        tick_once(&f.ctx, &f.ctx.downloads).await;

        let job = f.ctx.downloads.get(&("t".to_string(), "f.bin".to_string())).unwrap();
        let job = job.lock().await;
        assert_eq!(job.acquired(), 1);
        assert_eq!(job.state(), TransferState::Receiving);
    }

    #[tokio::test]
    async fn test_silence_abandons_after_bounded_rerequests() {
        let f = fixture(b"aaaabbbb").await;
        start(&f.ctx, "t", None).await.unwrap();

        // First tick sends the initial batch
        tick_once(&f.ctx, &f.ctx.downloads).await;
        f.transport.take();

        let sender = Envelope::new(Message::Hello, ip("10.0.0.2"), 6789);
        handle_piece_data(&f.ctx, &sender, PieceRef::new("t", "f.bin", 0), Bytes::from_static(b"aaaa")).await;
        tick_once(&f.ctx, &f.ctx.downloads).await;
        assert!(f.storage.has_partial("t", "f.bin"));
        f.transport.take();

        let mut retired = Vec::new();
        let mut ticks = 0;
        while retired.is_empty() && ticks < 20 {
            retired = tick_once(&f.ctx, &f.ctx.downloads).await;
            ticks += 1;
        }

        assert_eq!(ticks, 6);
        assert_eq!(retired[0].1, TransferState::Abandoned);
        let batches = f.transport.of_kind(MessageKind::PieceRequest);
        assert_eq!(batches.len(), 3);
        assert!(batches
            .iter()
            .all(|s| s.destination == Destination::Unicast(ip("10.0.0.2"), 6789)));
        assert!(!f.storage.has_partial("t", "f.bin"));
        assert!(!f.ctx.ownership.owns(&PieceRef::new("t", "f.bin", 0), ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_file_and_torrent() {
        let f = fixture(b"abc").await;
        assert!(start(&f.ctx, "t", Some("nope")).await.is_err());
        assert!(start(&f.ctx, "other", None).await.is_err());
    }

    #[tokio::test]
    async fn test_start_skips_held_file() {
        let f = fixture(b"abc").await;
        f.ctx.ownership.add_owner(&PieceRef::new("t", "f.bin", 0), ip("10.0.0.1"));
        assert_eq!(start(&f.ctx, "t", None).await.unwrap(), 0);
        assert!(f.ctx.downloads.is_empty());
    }
}
