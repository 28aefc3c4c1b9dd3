//! Inbound message routing
//!
//! Both sockets feed [`route`], the single entry point for protocol events.
//! Each message kind goes to exactly one component; datagrams this peer sent
//! itself (multicast loops back) are dropped here.

use std::sync::Arc;

use crate::config::MAX_UDP_PAYLOAD;
use crate::context::SwarmContext;
use crate::error::SwarmError;
use crate::liveness::HelloOutcome;
use crate::message::{Envelope, Message};
use crate::transfer::{catalog_sync, descriptor_fetch, download, upload};
use crate::transport::{Channel, UdpTransport};

/// Hand one received message to the component responsible for it.
pub async fn route(ctx: &Arc<SwarmContext>, envelope: Envelope) {
    if envelope.sender == ctx.me || envelope.message == Message::TimedOut {
        return;
    }

    tracing::trace!("{} from {}:{}", envelope.message, envelope.sender, envelope.port);

    match &envelope.message {
        Message::Hello => {
            if let HelloOutcome::Refreshed { request_catalog: true } =
                ctx.liveness.on_hello(envelope.sender)
            {
                ctx.transport
                    .unicast(&Message::ListRequest { piece: 0 }, envelope.sender, None)
                    .await;
            }
        }
        Message::TimedOut => {}
        Message::ListRequest { piece } => {
            catalog_sync::respond_list_request(ctx, &envelope, *piece).await;
        }
        Message::ListResponse { piece, total, data } => {
            catalog_sync::handle_list_response(ctx, &envelope, *piece, *total, data.clone()).await;
        }
        Message::TorrentRequest { torrent, piece } => {
            descriptor_fetch::respond_torrent_request(ctx, &envelope, torrent, *piece).await;
        }
        Message::TorrentFile { torrent, piece, data } => {
            descriptor_fetch::handle_torrent_file(ctx, torrent, *piece, data.clone()).await;
        }
        Message::WhoHas(piece) => {
            if ctx.ownership.owns(piece, ctx.me) {
                ctx.transport
                    .unicast(&Message::IHave(piece.clone()), envelope.sender, Some(envelope.port))
                    .await;
            }
        }
        Message::IHave(piece) => {
            // Owners must be aged by the heartbeat like any other peer
            ctx.liveness.ensure(envelope.sender);
            if !ctx.ownership.add_owner(piece, envelope.sender) {
                tracing::trace!("Ignoring ownership claim for untracked {}", envelope.message);
            }
        }
        Message::PieceRequest(piece) => {
            upload::handle_piece_request(ctx, &envelope, piece.clone()).await;
        }
        Message::PieceData { piece, data } => {
            download::handle_piece_data(ctx, &envelope, piece.clone(), data.clone()).await;
        }
    }
}

/// Read `channel` until shutdown, routing everything received.
pub async fn run_receive_loop(ctx: Arc<SwarmContext>, transport: Arc<UdpTransport>, channel: Channel) {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    while ctx.is_running() {
        let received = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            received = transport.receive(channel, &mut buf) => received,
        };

        match received {
            Ok(envelope) => route(&ctx, envelope).await,
            Err(SwarmError::Format { message }) => {
                tracing::warn!("Dropped malformed datagram on {:?}: {}", channel, message);
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    tracing::debug!("{:?} receive loop stopped", channel);
}
