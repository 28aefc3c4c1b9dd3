//! Catalog listings
//!
//! A catalog listing is the text a peer advertises for the torrents it holds:
//!
//! ```text
//! <torrent id>
//! <portable descriptor length in bytes>
//! <number of files>
//! <relative path>        (one line per file)
//! ```
//!
//! repeated for every torrent. [`NetworkCatalog`] accumulates the listings
//! received from other peers together with which peers advertised them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::RwLock;
use rand::seq::IteratorRandom;

use crate::error::{Result, SwarmError};

/// One torrent as advertised in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub descriptor_len: u64,
    pub files: Vec<String>,
}

/// Render entries as listing text
pub fn format_listing(entries: &[CatalogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.id);
        out.push('\n');
        out.push_str(&entry.descriptor_len.to_string());
        out.push('\n');
        out.push_str(&entry.files.len().to_string());
        out.push('\n');
        for file in &entry.files {
            out.push_str(file);
            out.push('\n');
        }
    }
    out
}

/// Parse listing text
pub fn parse_listing(text: &str) -> Result<Vec<CatalogEntry>> {
    let mut lines = text.lines();
    let mut entries = Vec::new();

    while let Some(id) = lines.next() {
        if id.is_empty() {
            continue;
        }
        let descriptor_len = next_line(&mut lines, id)?.parse()?;
        let count: usize = next_line(&mut lines, id)?.parse()?;
        let mut files = Vec::new();
        for _ in 0..count {
            files.push(next_line(&mut lines, id)?.to_string());
        }
        entries.push(CatalogEntry {
            id: id.to_string(),
            descriptor_len,
            files,
        });
    }

    Ok(entries)
}

fn next_line<'a>(lines: &mut std::str::Lines<'a>, id: &str) -> Result<&'a str> {
    lines
        .next()
        .ok_or_else(|| SwarmError::format(format!("catalog entry '{}' is truncated", id)))
}

/// A torrent known from other peers' listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTorrent {
    pub descriptor_len: u64,
    pub files: Vec<String>,
    pub owners: HashSet<IpAddr>,
}

/// Torrents advertised on the network and the peers advertising them
#[derive(Debug, Default)]
pub struct NetworkCatalog {
    torrents: RwLock<HashMap<String, RemoteTorrent>>,
}

impl NetworkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every entry of `owner`'s listing
    pub fn merge(&self, entries: &[CatalogEntry], owner: IpAddr) {
        let mut torrents = self.torrents.write();
        for entry in entries {
            let torrent = torrents
                .entry(entry.id.clone())
                .or_insert_with(|| RemoteTorrent {
                    descriptor_len: entry.descriptor_len,
                    files: entry.files.clone(),
                    owners: HashSet::new(),
                });
            torrent.descriptor_len = entry.descriptor_len;
            torrent.files = entry.files.clone();
            torrent.owners.insert(owner);
        }
    }

    /// Forget `owner`; torrents nobody else advertises disappear
    pub fn remove_owner(&self, owner: IpAddr) {
        self.torrents.write().retain(|_, torrent| {
            torrent.owners.remove(&owner);
            !torrent.owners.is_empty()
        });
    }

    pub fn get(&self, id: &str) -> Option<RemoteTorrent> {
        self.torrents.read().get(id).cloned()
    }

    /// A random advertiser of `id`, skipping `except`
    pub fn pick_owner(&self, id: &str, except: Option<IpAddr>) -> Option<IpAddr> {
        self.torrents.read().get(id).and_then(|torrent| {
            torrent
                .owners
                .iter()
                .copied()
                .filter(|owner| Some(*owner) != except)
                .choose(&mut rand::thread_rng())
        })
    }

    /// Every known torrent, sorted by ID
    pub fn snapshot(&self) -> Vec<(String, RemoteTorrent)> {
        let mut all: Vec<_> = self
            .torrents
            .read()
            .iter()
            .map(|(id, torrent)| (id.clone(), torrent.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn references(&self, peer: IpAddr) -> bool {
        self.torrents
            .read()
            .values()
            .any(|torrent| torrent.owners.contains(&peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn entries() -> Vec<CatalogEntry> {
        vec![
            CatalogEntry {
                id: "movies".into(),
                descriptor_len: 412,
                files: vec!["a/one.mkv".into(), "two.mkv".into()],
            },
            CatalogEntry {
                id: "empty".into(),
                descriptor_len: 20,
                files: vec![],
            },
        ]
    }

    #[test]
    fn test_listing_text_layout() {
        let text = format_listing(&entries());
        assert_eq!(text, "movies\n412\n2\na/one.mkv\ntwo.mkv\nempty\n20\n0\n");
        assert_eq!(parse_listing(&text).unwrap(), entries());
    }

    #[test]
    fn test_parse_rejects_truncated_listing() {
        assert!(parse_listing("movies\n412\n2\na/one.mkv\n").is_err());
        assert!(parse_listing("movies\nbig\n0\n").is_err());
        assert!(parse_listing("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_huge_file_count() {
        let err = parse_listing("x\n1\n18446744073709551615\n").unwrap_err();
        assert!(matches!(err, SwarmError::Format { .. }));
    }

    #[test]
    fn test_merge_and_remove_owner() {
        let catalog = NetworkCatalog::new();
        catalog.merge(&entries(), ip("10.0.0.2"));
        catalog.merge(&entries()[..1], ip("10.0.0.3"));

        assert_eq!(catalog.get("movies").unwrap().owners.len(), 2);

        catalog.remove_owner(ip("10.0.0.2"));
        assert!(catalog.get("empty").is_none());
        assert_eq!(
            catalog.pick_owner("movies", None),
            Some(ip("10.0.0.3"))
        );
        assert_eq!(catalog.pick_owner("movies", Some(ip("10.0.0.3"))), None);
        assert!(!catalog.references(ip("10.0.0.2")));
    }
}
