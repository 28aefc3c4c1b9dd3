//! Peer liveness tracking
//!
//! Every heartbeat period this peer multicasts `HELLO` and counts one missed
//! period against every known seeder. A `HELLO` from a seeder resets its
//! counter; a seeder that misses `dead_after_missed` periods in a row is
//! declared dead and every piece of state keyed by it is dropped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::SwarmContext;
use crate::message::Message;

/// Freshness of the catalog we hold for a seeder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    OutOfDate,
    BeingUpdated,
    UpToDate,
}

/// Lifecycle of a seeder entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Seen once, no heartbeat accounting yet
    New,
    /// Heartbeats observed
    Tracked,
    /// Missed too many heartbeats; only ever seen in death reports
    Dead,
}

/// Per-peer liveness record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeederStatus {
    pub missed_heartbeats: u32,
    pub catalog: CatalogState,
    pub phase: PeerPhase,
}

impl SeederStatus {
    fn new() -> Self {
        Self {
            missed_heartbeats: 0,
            catalog: CatalogState::OutOfDate,
            phase: PeerPhase::New,
        }
    }
}

/// What a received HELLO changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// Our own heartbeat looped back
    Ignored,
    /// First contact; nothing else to do this round
    Registered,
    /// Known peer; ask for its catalog when ours is stale
    Refreshed { request_catalog: bool },
}

/// The seeder map. Only this type mutates `SeederStatus` entries.
#[derive(Debug)]
pub struct Liveness {
    me: IpAddr,
    dead_after_missed: u32,
    seeders: RwLock<HashMap<IpAddr, SeederStatus>>,
}

impl Liveness {
    pub fn new(me: IpAddr, dead_after_missed: u32) -> Self {
        Self {
            me,
            dead_after_missed,
            seeders: RwLock::new(HashMap::new()),
        }
    }

    /// Account for a HELLO from `peer`
    pub fn on_hello(&self, peer: IpAddr) -> HelloOutcome {
        if peer == self.me {
            return HelloOutcome::Ignored;
        }

        let mut seeders = self.seeders.write();
        match seeders.get_mut(&peer) {
            None => {
                seeders.insert(peer, SeederStatus::new());
                tracing::info!("New peer {}", peer);
                HelloOutcome::Registered
            }
            Some(status) => {
                status.missed_heartbeats = 0;
                status.phase = PeerPhase::Tracked;
                HelloOutcome::Refreshed {
                    request_catalog: status.catalog == CatalogState::OutOfDate,
                }
            }
        }
    }

    /// Create an entry for `peer` if it has none. Returns true when created.
    pub fn ensure(&self, peer: IpAddr) -> bool {
        if peer == self.me {
            return false;
        }
        let mut seeders = self.seeders.write();
        if seeders.contains_key(&peer) {
            return false;
        }
        seeders.insert(peer, SeederStatus::new());
        tracing::info!("New peer {}", peer);
        true
    }

    /// Update the catalog freshness of a known peer
    pub fn set_catalog_state(&self, peer: IpAddr, state: CatalogState) {
        if let Some(status) = self.seeders.write().get_mut(&peer) {
            status.catalog = state;
        }
    }

    /// Count one heartbeat period against every seeder.
    ///
    /// Seeders reaching the threshold are removed and returned with phase
    /// `Dead`.
    pub fn count_period(&self) -> Vec<(IpAddr, SeederStatus)> {
        let mut seeders = self.seeders.write();
        let mut dead = Vec::new();

        for (peer, status) in seeders.iter_mut() {
            status.missed_heartbeats += 1;
            if status.missed_heartbeats >= self.dead_after_missed {
                status.phase = PeerPhase::Dead;
                dead.push((*peer, *status));
            }
        }

        for (peer, _) in &dead {
            seeders.remove(peer);
        }
        dead
    }

    pub fn is_alive(&self, peer: IpAddr) -> bool {
        self.seeders.read().contains_key(&peer)
    }

    pub fn status(&self, peer: IpAddr) -> Option<SeederStatus> {
        self.seeders.read().get(&peer).copied()
    }

    /// Known peers, sorted by address
    pub fn peers(&self) -> Vec<(IpAddr, SeederStatus)> {
        let mut peers: Vec<_> = self
            .seeders
            .read()
            .iter()
            .map(|(peer, status)| (*peer, *status))
            .collect();
        peers.sort_by_key(|(peer, _)| *peer);
        peers
    }

    pub fn len(&self) -> usize {
        self.seeders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeders.read().is_empty()
    }
}

/// Broadcast HELLO and age every seeder once per heartbeat period until
/// shutdown.
pub async fn run_heartbeat(ctx: Arc<SwarmContext>) {
    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval_duration());

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        ctx.transport.multicast(&Message::Hello).await;

        for (peer, status) in ctx.liveness.count_period() {
            tracing::info!(
                "Peer {} is dead after {} missed heartbeats",
                peer,
                status.missed_heartbeats
            );
            ctx.forget_peer(peer).await;
        }
    }

    tracing::debug!("Heartbeat stopped");
}
