//! Piece ownership directory
//!
//! Maps `torrent -> file -> piece -> {peers}`. Entries exist only for torrents
//! whose descriptor we hold; ownership claims about anything else are dropped.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::RwLock;
use rand::seq::IteratorRandom;

use crate::message::PieceRef;

type FileOwners = Vec<HashSet<IpAddr>>;

/// Rank pieces by ascending owner count.
///
/// The sort is stable: pieces with the same number of owners keep their
/// index order.
pub fn rank_by_rarity(owner_counts: &[usize]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..owner_counts.len() as u32).collect();
    order.sort_by_key(|&piece| owner_counts[piece as usize]);
    order
}

#[derive(Debug, Default)]
pub struct OwnershipDirectory {
    table: RwLock<HashMap<String, HashMap<String, FileOwners>>>,
}

impl OwnershipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a torrent's files with the given piece counts.
    ///
    /// Already tracked files keep their owner sets.
    pub fn track_torrent(&self, torrent: &str, files: &[(String, u32)]) {
        let mut table = self.table.write();
        let entry = table.entry(torrent.to_string()).or_default();
        for (file, pieces) in files {
            entry
                .entry(file.clone())
                .or_insert_with(|| vec![HashSet::new(); *pieces as usize]);
        }
    }

    pub fn is_tracked(&self, torrent: &str) -> bool {
        self.table.read().contains_key(torrent)
    }

    /// Record `peer` as holding `piece`. Returns false when the piece is not
    /// part of a tracked torrent.
    pub fn add_owner(&self, piece: &PieceRef, peer: IpAddr) -> bool {
        let mut table = self.table.write();
        match table
            .get_mut(&piece.torrent)
            .and_then(|files| files.get_mut(&piece.file))
            .and_then(|pieces| pieces.get_mut(piece.piece as usize))
        {
            Some(owners) => {
                owners.insert(peer);
                true
            }
            None => false,
        }
    }

    pub fn remove_owner(&self, piece: &PieceRef, peer: IpAddr) {
        let mut table = self.table.write();
        if let Some(owners) = table
            .get_mut(&piece.torrent)
            .and_then(|files| files.get_mut(&piece.file))
            .and_then(|pieces| pieces.get_mut(piece.piece as usize))
        {
            owners.remove(&peer);
        }
    }

    pub fn owns(&self, piece: &PieceRef, peer: IpAddr) -> bool {
        self.table
            .read()
            .get(&piece.torrent)
            .and_then(|files| files.get(&piece.file))
            .and_then(|pieces| pieces.get(piece.piece as usize))
            .map_or(false, |owners| owners.contains(&peer))
    }

    /// A uniformly random owner of `piece`, excluding `except`
    pub fn pick_owner(&self, piece: &PieceRef, except: IpAddr) -> Option<IpAddr> {
        let table = self.table.read();
        let owners = table
            .get(&piece.torrent)?
            .get(&piece.file)?
            .get(piece.piece as usize)?;
        owners
            .iter()
            .copied()
            .filter(|owner| *owner != except)
            .choose(&mut rand::thread_rng())
    }

    /// Number of known owners of every piece of a file
    pub fn owner_counts(&self, torrent: &str, file: &str) -> Option<Vec<usize>> {
        self.table
            .read()
            .get(torrent)?
            .get(file)
            .map(|pieces| pieces.iter().map(HashSet::len).collect())
    }

    /// Pieces of a file, rarest first
    pub fn rarity_order(&self, torrent: &str, file: &str) -> Vec<u32> {
        self.owner_counts(torrent, file)
            .map(|counts| rank_by_rarity(&counts))
            .unwrap_or_default()
    }

    /// Whether some piece of `torrent` does not list `peer` as an owner
    pub fn missing_owner(&self, torrent: &str, peer: IpAddr) -> bool {
        self.table.read().get(torrent).map_or(false, |files| {
            files
                .values()
                .flatten()
                .any(|owners| !owners.contains(&peer))
        })
    }

    /// Drop `peer` from every owner set
    pub fn remove_peer(&self, peer: IpAddr) {
        let mut table = self.table.write();
        for owners in table.values_mut().flat_map(|files| files.values_mut()).flatten() {
            owners.remove(&peer);
        }
    }

    /// Whether `peer` appears anywhere in the directory
    pub fn references(&self, peer: IpAddr) -> bool {
        self.table
            .read()
            .values()
            .flat_map(|files| files.values())
            .flatten()
            .any(|owners| owners.contains(&peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn directory() -> OwnershipDirectory {
        let dir = OwnershipDirectory::new();
        dir.track_torrent("t", &[("a.bin".to_string(), 5), ("b.bin".to_string(), 1)]);
        dir
    }

    #[test]
    fn test_rank_by_rarity_is_stable() {
        assert_eq!(rank_by_rarity(&[3, 1, 2, 1, 0]), vec![4, 1, 3, 2, 0]);
        assert_eq!(rank_by_rarity(&[]), Vec::<u32>::new());
        assert_eq!(rank_by_rarity(&[2, 2, 2]), vec![0, 1, 2]);
    }

    #[test]
    fn test_rarity_order_from_table() {
        let dir = directory();
        let owners = ["10.0.0.2", "10.0.0.3", "10.0.0.4"];
        for (piece, count) in [3usize, 1, 2, 1, 0].iter().enumerate() {
            for owner in &owners[..*count] {
                dir.add_owner(&PieceRef::new("t", "a.bin", piece as u32), ip(owner));
            }
        }

        let order = dir.rarity_order("t", "a.bin");
        assert_eq!(order, vec![4, 1, 3, 2, 0]);
    }

    #[test]
    fn test_untracked_claims_dropped() {
        let dir = directory();
        assert!(!dir.add_owner(&PieceRef::new("other", "a.bin", 0), ip("10.0.0.2")));
        assert!(!dir.add_owner(&PieceRef::new("t", "a.bin", 5), ip("10.0.0.2")));
        assert!(dir.add_owner(&PieceRef::new("t", "a.bin", 4), ip("10.0.0.2")));
    }

    #[test]
    fn test_pick_owner() {
        let dir = directory();
        let me = ip("10.0.0.1");
        let piece = PieceRef::new("t", "a.bin", 2);
        assert_eq!(dir.pick_owner(&piece, me), None);

        dir.add_owner(&piece, me);
        assert_eq!(dir.pick_owner(&piece, me), None);

        dir.add_owner(&piece, ip("10.0.0.2"));
        assert_eq!(dir.pick_owner(&piece, me), Some(ip("10.0.0.2")));
    }

    #[test]
    fn test_remove_peer_purges_everything() {
        let dir = directory();
        let peer = ip("10.0.0.9");
        for piece in 0..5 {
            dir.add_owner(&PieceRef::new("t", "a.bin", piece), peer);
        }
        dir.add_owner(&PieceRef::new("t", "b.bin", 0), peer);
        assert!(dir.references(peer));

        dir.remove_peer(peer);
        assert!(!dir.references(peer));
        assert_eq!(dir.owner_counts("t", "a.bin").unwrap(), vec![0; 5]);
    }

    #[test]
    fn test_missing_owner() {
        let dir = directory();
        let peer = ip("10.0.0.2");
        assert!(dir.missing_owner("t", peer));
        for piece in 0..5 {
            dir.add_owner(&PieceRef::new("t", "a.bin", piece), peer);
        }
        assert!(dir.missing_owner("t", peer));
        dir.add_owner(&PieceRef::new("t", "b.bin", 0), peer);
        assert!(!dir.missing_owner("t", peer));
        assert!(!dir.missing_owner("unknown", peer));
    }

    #[test]
    fn test_retracking_keeps_owners() {
        let dir = directory();
        let piece = PieceRef::new("t", "b.bin", 0);
        dir.add_owner(&piece, ip("10.0.0.2"));
        dir.track_torrent("t", &[("b.bin".to_string(), 1)]);
        assert!(dir.owns(&piece, ip("10.0.0.2")));
    }
}
