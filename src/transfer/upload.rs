//! Piece upload
//!
//! One job per requesting peer. Requests queue up in arrival order and each
//! tick serves at most `max_in_flight` of them. Requests are never timed out;
//! a job is retired only after its queue has stayed empty for a while.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, TransferState};
use crate::context::SwarmContext;
use crate::message::{Envelope, Message, PieceRef};

pub struct UploadJob {
    peer: IpAddr,
    port: u16,
    queue: VecDeque<PieceRef>,
    queued: HashSet<PieceRef>,
    max_queue: usize,
    idle_periods: u32,
    state: TransferState,
}

impl UploadJob {
    pub fn new(peer: IpAddr, port: u16, max_queue: usize) -> Self {
        Self {
            peer,
            port,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            max_queue,
            idle_periods: 0,
            state: TransferState::Idle,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue a request. Duplicates of a queued piece and requests beyond the
    /// queue bound are dropped.
    pub fn accept(&mut self, piece: PieceRef, port: u16) -> bool {
        self.port = port;
        if self.queue.len() >= self.max_queue || self.queued.contains(&piece) {
            return false;
        }
        self.queued.insert(piece.clone());
        self.queue.push_back(piece);
        true
    }
}

#[async_trait]
impl Job for UploadJob {
    async fn tick(&mut self, ctx: &Arc<SwarmContext>) -> TransferState {
        if self.state.is_terminal() {
            return self.state;
        }

        let mut served = 0;
        while served < ctx.config.max_in_flight {
            let Some(piece) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&piece);
            served += 1;

            match ctx.storage.read_piece(&piece).await {
                Ok(Some(data)) => {
                    let reply = Message::PieceData { piece, data };
                    ctx.transport.unicast(&reply, self.peer, Some(self.port)).await;
                }
                Ok(None) => tracing::debug!("{} asked for a piece we lack", self.peer),
                Err(e) => tracing::warn!("Cannot read piece for {}: {}", self.peer, e),
            }
        }

        if served > 0 {
            self.idle_periods = 0;
            self.state = TransferState::Receiving;
            return self.state;
        }

        self.idle_periods += 1;
        self.state = if self.idle_periods >= 2 * ctx.config.max_idle_periods {
            TransferState::Done
        } else {
            TransferState::Idle
        };
        self.state
    }
}

/// Queue a `PIECE_REQUEST` on the requester's upload job
pub async fn handle_piece_request(ctx: &SwarmContext, envelope: &Envelope, piece: PieceRef) {
    let peer = envelope.sender;
    let (job, _) = ctx.uploads.get_or_insert_with(peer, || {
        UploadJob::new(peer, envelope.port, ctx.config.max_upload_queue)
    });
    if !job.lock().await.accept(piece, envelope.port) {
        tracing::debug!("Dropped piece request from {}", peer);
    }
}
