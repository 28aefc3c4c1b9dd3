//! Test Helpers
//!
//! An in-process LAN: every peer gets a [`RecordingTransport`] and a
//! [`MemoryStorage`], and [`Lan::deliver`] moves whatever the peers sent to
//! the peers it was addressed to, through the real dispatch router.

#![allow(dead_code)]

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use lanswarm::context::SwarmContext;
use lanswarm::dispatch;
use lanswarm::storage::{MemoryStorage, Storage};
use lanswarm::transfer::tick_once;
use lanswarm::transport::{Destination, RecordingTransport, Sent};
use lanswarm::{Envelope, Message, SwarmConfig};

/// Piece size used by every test peer
pub const UNIT: usize = 4;

/// Multicast port of the test LAN
pub const PORT: u16 = 6789;

/// Unicast source port of the peer with the given last octet
pub fn unicast_port(octet: u8) -> u16 {
    40_000 + u16::from(octet)
}

pub fn ip(octet: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, octet])
}

/// Configuration of a test peer: small pieces, no probe traffic
pub fn test_config() -> SwarmConfig {
    SwarmConfig {
        probe_rounds: 0,
        probe_message_delay_ms: 0,
        probe_round_delay_ms: 0,
        ..SwarmConfig::default().unit_size(UNIT)
    }
}

/// One simulated peer
pub struct TestPeer {
    pub octet: u8,
    pub ctx: Arc<SwarmContext>,
    pub transport: Arc<RecordingTransport>,
    pub storage: Arc<MemoryStorage>,
}

impl TestPeer {
    pub fn new(octet: u8) -> Self {
        Self::with_config(octet, test_config())
    }

    pub fn with_config(octet: u8, config: SwarmConfig) -> Self {
        let transport = Arc::new(RecordingTransport::new(config.port));
        let storage = Arc::new(MemoryStorage::new(config.unit_size));
        let ctx = SwarmContext::new(config, ip(octet), transport.clone(), storage.clone());
        Self {
            octet,
            ctx,
            transport,
            storage,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ctx.me
    }

    /// Hold `files` completely and announce them
    pub async fn share(&self, torrent: &str, files: &[(&str, &[u8])]) {
        self.storage.add_torrent(torrent, files);
        lanswarm::context::adopt_torrent(&self.ctx, torrent)
            .await
            .unwrap();
    }

    /// Know `torrent`'s descriptor without holding any of its bytes
    pub async fn expect(&self, torrent: &str, files: &[(&str, &[u8])]) {
        let descriptor = self.storage.describe(torrent, files);
        self.storage
            .register_descriptor(descriptor.portable_text().as_bytes(), Path::new("downloads"))
            .await
            .unwrap();
        lanswarm::context::adopt_torrent(&self.ctx, torrent)
            .await
            .unwrap();
    }

    /// Hand a message to this peer as if `from` had sent it
    pub async fn receive(&self, message: Message, from: &TestPeer, multicast: bool) {
        let port = if multicast { PORT } else { unicast_port(from.octet) };
        dispatch::route(&self.ctx, Envelope::new(message, from.ip(), port)).await;
    }

    /// Run every reaper once
    pub async fn tick(&self) {
        tick_once(&self.ctx, &self.ctx.catalog_jobs).await;
        tick_once(&self.ctx, &self.ctx.descriptor_jobs).await;
        tick_once(&self.ctx, &self.ctx.downloads).await;
        tick_once(&self.ctx, &self.ctx.uploads).await;
    }

    /// Heartbeat periods without hearing from anyone; dead peers are forgotten
    pub async fn miss_heartbeats(&self, periods: u32) -> Vec<IpAddr> {
        let mut dead = Vec::new();
        for _ in 0..periods {
            for (peer, _) in self.ctx.liveness.count_period() {
                self.ctx.forget_peer(peer).await;
                dead.push(peer);
            }
        }
        dead
    }
}

/// A set of peers wired together
pub struct Lan {
    pub peers: Vec<TestPeer>,
}

impl Lan {
    pub fn new(octets: &[u8]) -> Self {
        Self {
            peers: octets.iter().map(|&o| TestPeer::new(o)).collect(),
        }
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    /// Deliver everything sent so far, once. Returns the number of
    /// deliveries; messages to unknown addresses are lost.
    pub async fn deliver(&self) -> usize {
        let mut delivered = 0;
        for sender in &self.peers {
            for Sent {
                message,
                destination,
            } in sender.transport.take()
            {
                for receiver in &self.peers {
                    let addressed = match destination {
                        Destination::Multicast => receiver.octet != sender.octet,
                        Destination::Unicast(to, _) => to == receiver.ip(),
                    };
                    if addressed {
                        let multicast = destination == Destination::Multicast;
                        receiver.receive(message.clone(), sender, multicast).await;
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Deliver and tick until the LAN goes quiet or `rounds` runs out
    pub async fn run(&self, rounds: usize) {
        for _ in 0..rounds {
            let delivered = self.deliver().await;
            for peer in &self.peers {
                peer.tick().await;
            }
            if delivered == 0 && self.peers.iter().all(|p| p.transport.sent().is_empty()) {
                let busy = self.peers.iter().any(|p| {
                    !p.ctx.catalog_jobs.is_empty()
                        || !p.ctx.descriptor_jobs.is_empty()
                        || !p.ctx.downloads.is_empty()
                });
                if !busy {
                    return;
                }
            }
        }
    }
}
