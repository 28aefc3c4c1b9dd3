//! Catalog synchronization
//!
//! Listings travel as `LIST_RESPONSE` chunks, either pushed by multicast when
//! a peer's catalog changes or pulled with `LIST_REQUEST`. One job per sending
//! peer reassembles the listing and merges it into the network catalog.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{chunk, chunk_count, IdleVerdict, Job, TransferState, UnitTracker};
use crate::catalog::{format_listing, parse_listing};
use crate::context::SwarmContext;
use crate::error::Result;
use crate::liveness::CatalogState;
use crate::message::{Envelope, Message};
use crate::probe;

pub struct CatalogSyncJob {
    peer: IpAddr,
    /// Port the peer last sent from; re-requests go there
    port: u16,
    tracker: UnitTracker,
    chunks: BTreeMap<u32, Bytes>,
    state: TransferState,
}

impl CatalogSyncJob {
    pub fn new(peer: IpAddr, port: u16, total: u32, max_idle_periods: u32) -> Self {
        Self {
            peer,
            port,
            tracker: UnitTracker::new(total, max_idle_periods),
            chunks: BTreeMap::new(),
            state: TransferState::Receiving,
        }
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Buffer one chunk. A different total means the listing changed under
    /// us; start over.
    pub fn accept(&mut self, piece: u32, total: u32, data: Bytes, port: u16) -> bool {
        self.port = port;
        if total != self.tracker.total() {
            tracing::debug!(
                "Catalog of {} changed size ({} -> {} chunks), restarting",
                self.peer,
                self.tracker.total(),
                total
            );
            self.tracker.reset(total);
            self.chunks.clear();
        }
        self.tracker.offer(piece, data)
    }

    fn assemble(&self) -> String {
        let bytes: Vec<u8> = self.chunks.values().flat_map(|c| c.iter().copied()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn complete(&mut self, ctx: &Arc<SwarmContext>) -> TransferState {
        let entries = match parse_listing(&self.assemble()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Discarding catalog from {}: {}", self.peer, e);
                ctx.liveness.set_catalog_state(self.peer, CatalogState::OutOfDate);
                return TransferState::Abandoned;
            }
        };

        ctx.catalog.merge(&entries, self.peer);
        ctx.liveness.set_catalog_state(self.peer, CatalogState::UpToDate);
        tracing::info!("Catalog of {} updated ({} torrents)", self.peer, entries.len());

        // Ask the peer directly about torrents we share but have not seen it hold
        for entry in &entries {
            if ctx.storage.has_torrent(&entry.id).await
                && ctx.ownership.missing_owner(&entry.id, self.peer)
            {
                probe::spawn(ctx.clone(), entry.id.clone(), Some(self.peer));
            }
        }

        TransferState::Done
    }
}

#[async_trait]
impl Job for CatalogSyncJob {
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

        self.state = match self.tracker.end_tick() {
            IdleVerdict::Active => TransferState::Receiving,
            IdleVerdict::Wait => TransferState::Requesting,
            IdleVerdict::Rerequest => {
                if let Some(piece) = self.tracker.first_missing() {
                    ctx.transport
                        .unicast(&Message::ListRequest { piece }, self.peer, Some(self.port))
                        .await;
                }
                TransferState::Requesting
            }
            IdleVerdict::Abandon => {
                tracing::info!("Gave up on catalog of {}", self.peer);
                ctx.liveness.set_catalog_state(self.peer, CatalogState::OutOfDate);
                TransferState::Abandoned
            }
        };
        self.state
    }
}

/// Route a `LIST_RESPONSE` chunk to the sender's sync job, creating it first
/// if needed. Listings claiming more than `max_resource_units` chunks are
/// dropped.
pub async fn handle_list_response(
    ctx: &SwarmContext,
    envelope: &Envelope,
    piece: u32,
    total: u32,
    data: Bytes,
) {
    let peer = envelope.sender;
    if total == 0 || total > ctx.config.max_resource_units {
        tracing::warn!("Ignoring catalog chunk from {} claiming {} chunks", peer, total);
        return;
    }
    ctx.liveness.ensure(peer);

    let (job, created) = ctx.catalog_jobs.get_or_insert_with(peer, || {
        CatalogSyncJob::new(peer, envelope.port, total, ctx.config.max_idle_periods)
    });
    if created {
        ctx.liveness.set_catalog_state(peer, CatalogState::BeingUpdated);
    }
    job.lock().await.accept(piece, total, data, envelope.port);
}

/// Local listing text
pub async fn local_listing(ctx: &SwarmContext) -> Result<(usize, Bytes)> {
    let entries = ctx.storage.local_catalog().await?;
    Ok((entries.len(), Bytes::from(format_listing(&entries))))
}

/// Answer a `LIST_REQUEST` with the requested chunk of our listing.
pub async fn respond_list_request(ctx: &SwarmContext, envelope: &Envelope, piece: u32) {
    let (_, listing) = match local_listing(ctx).await {
        Ok(listing) => listing,
        Err(e) => {
            tracing::warn!("Cannot read local catalog: {}", e);
            return;
        }
    };

    let unit = ctx.config.unit_size;
    let total = chunk_count(listing.len(), unit);
    if let Some(data) = chunk(&listing, piece, unit) {
        let reply = Message::ListResponse { piece, total, data };
        ctx.transport
            .unicast(&reply, envelope.sender, Some(envelope.port))
            .await;
    }
}

/// Multicast our whole listing, chunk by chunk. Nothing is sent when we hold
/// no torrents.
pub async fn propagate_catalog(ctx: &SwarmContext) -> Result<u32> {
    let (count, listing) = local_listing(ctx).await?;
    if count == 0 {
        return Ok(0);
    }

    let unit = ctx.config.unit_size;
    let total = chunk_count(listing.len(), unit);
    for piece in 0..total {
        if let Some(data) = chunk(&listing, piece, unit) {
            ctx.transport
                .multicast(&Message::ListResponse { piece, total, data })
                .await;
        }
    }

    tracing::debug!("Propagated catalog ({} torrents, {} chunks)", count, total);
    Ok(total)
}
