//! Owner probing
//!
//! Asks `WHO_HAS` for every piece of every file of a torrent, a fixed number
//! of rounds. Nothing is acknowledged, so repetition stands in for
//! reliability; the delays keep the burst from flooding the LAN.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::context::SwarmContext;
use crate::message::{Message, PieceRef};

/// Probe the whole network (`target == None`) or a single peer.
pub fn spawn(ctx: Arc<SwarmContext>, torrent: String, target: Option<IpAddr>) -> JoinHandle<()> {
    tokio::spawn(async move { run(&ctx, &torrent, target).await })
}

pub async fn run(ctx: &SwarmContext, torrent: &str, target: Option<IpAddr>) {
    let files = match ctx.storage.files(torrent).await {
        Ok(files) => files,
        Err(e) => {
            tracing::debug!("Not probing '{}': {}", torrent, e);
            return;
        }
    };

    tracing::debug!(
        "Probing owners of '{}' ({})",
        torrent,
        target.map_or_else(|| "multicast".to_string(), |p| p.to_string())
    );

    let rounds = ctx.config.probe_rounds;
    for round in 0..rounds {
        for (file, pieces) in &files {
            for piece in 0..*pieces {
                if !ctx.is_running() {
                    return;
                }

                let message = Message::WhoHas(PieceRef::new(torrent, file.clone(), piece));
                match target {
                    Some(peer) => ctx.transport.unicast(&message, peer, None).await,
                    None => ctx.transport.multicast(&message).await,
                }
                tokio::time::sleep(ctx.config.probe_message_delay()).await;
            }
        }

        if round + 1 < rounds {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return,
                _ = tokio::time::sleep(ctx.config.probe_round_delay()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::message::MessageKind;
    use crate::storage::MemoryStorage;
    use crate::transport::{Destination, RecordingTransport};

    fn context(transport: Arc<RecordingTransport>) -> Arc<SwarmContext> {
        let storage = MemoryStorage::new(4);
        storage.add_torrent("t", &[("a", b"0123456789"), ("b", b"x")]);
        let config = SwarmConfig {
            probe_message_delay_ms: 0,
            probe_round_delay_ms: 5,
            ..SwarmConfig::default()
        };
        SwarmContext::new(
            config,
            "10.0.0.1".parse().unwrap(),
            transport,
            Arc::new(storage),
        )
    }

    #[tokio::test]
    async fn test_probe_asks_every_piece_each_round() {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = context(transport.clone());

        run(&ctx, "t", None).await;

        let asked = transport.of_kind(MessageKind::WhoHas);
        // 3 pieces of a + 1 piece of b, two rounds
        assert_eq!(asked.len(), 8);
        assert!(asked.iter().all(|s| s.destination == Destination::Multicast));
    }

    #[tokio::test]
    async fn test_directed_probe_unicasts() {
        let transport = Arc::new(RecordingTransport::new(6789));
        let ctx = context(transport.clone());
        let peer: IpAddr = "10.0.0.7".parse().unwrap();

        run(&ctx, "t", Some(peer)).await;

        let asked = transport.sent();
        assert_eq!(asked.len(), 8);
        assert!(asked
            .iter()
            .all(|s| s.destination == Destination::Unicast(peer, 6789)));
    }

    #[tokio::test]
    async fn test_probe_unknown_torrent_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = context(transport.clone());
        run(&ctx, "missing", None).await;
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_probe_stops_on_shutdown() {
        let transport = Arc::new(RecordingTransport::default());
        let ctx = context(transport.clone());
        ctx.shutdown.cancel();
        run(&ctx, "t", None).await;
        assert!(transport.sent().is_empty());
    }
}
