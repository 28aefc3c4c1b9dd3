//! Storage Module
//!
//! Local persistence of torrent descriptors and file bytes. The protocol core
//! only talks to the [`Storage`] trait: it reads, writes and verifies single
//! pieces and asks for the local catalog. [`FsStorage`] keeps everything on
//! disk; [`MemoryStorage`] backs the tests.

pub mod fs;

pub use fs::FsStorage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::catalog::CatalogEntry;
use crate::descriptor::{self, DescriptorFile, TorrentDescriptor};
use crate::error::{ProtocolErrorKind, Result, SwarmError};
use crate::message::PieceRef;

/// Storage collaborator consumed by the protocol engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Unit size pieces are cut to
    fn unit_size(&self) -> usize;

    /// Catalog entries for every local torrent, sorted by ID
    async fn local_catalog(&self) -> Result<Vec<CatalogEntry>>;

    /// Files of a local torrent with their piece counts
    async fn files(&self, torrent: &str) -> Result<Vec<(String, u32)>>;

    /// Whether a descriptor for `torrent` is held locally
    async fn has_torrent(&self, torrent: &str) -> bool;

    /// Wire form of a local descriptor
    async fn descriptor_bytes(&self, torrent: &str) -> Result<Bytes>;

    /// Check `data` against the descriptor hash of `piece`
    async fn verify_piece(&self, piece: &PieceRef, data: &[u8]) -> Result<bool>;

    /// Bytes of a piece, `None` when not held
    async fn read_piece(&self, piece: &PieceRef) -> Result<Option<Bytes>>;

    /// Store one piece of a file being downloaded
    async fn write_piece(&self, piece: &PieceRef, data: &[u8]) -> Result<()>;

    /// All pieces of a file are written; make it final
    async fn finish_file(&self, torrent: &str, file: &str) -> Result<()>;

    /// Drop a partially downloaded file
    async fn discard_file(&self, torrent: &str, file: &str) -> Result<()>;

    /// Whether every file of a torrent is complete locally
    async fn is_complete(&self, torrent: &str) -> Result<bool>;

    /// Pieces of a torrent already held in final files and matching their hash
    async fn verified_pieces(&self, torrent: &str) -> Result<Vec<PieceRef>>;

    /// Adopt a fetched descriptor, rooting its files at `destination`.
    /// Returns the torrent ID.
    async fn register_descriptor(&self, descriptor: &[u8], destination: &Path) -> Result<String>;

    /// Build and adopt a descriptor for local `paths`
    async fn publish(&self, id: &str, paths: &[PathBuf]) -> Result<()>;

    /// Load descriptors persisted by earlier runs; returns their IDs
    async fn load_local(&self) -> Result<Vec<String>>;
}

pub(crate) fn unknown_torrent(torrent: &str) -> SwarmError {
    SwarmError::protocol(
        ProtocolErrorKind::UnknownTorrent,
        format!("torrent '{}' is not held locally", torrent),
    )
}

pub(crate) fn unknown_file(torrent: &str, file: &str) -> SwarmError {
    SwarmError::protocol(
        ProtocolErrorKind::UnknownFile,
        format!("'{}' is not part of torrent '{}'", file, torrent),
    )
}

pub(crate) fn catalog_entry(descriptor: &TorrentDescriptor) -> CatalogEntry {
    CatalogEntry {
        id: descriptor.id.clone(),
        descriptor_len: descriptor.portable_text().len() as u64,
        files: descriptor.files.iter().map(|f| f.path.clone()).collect(),
    }
}

pub(crate) fn expected_hash<'a>(
    descriptor: &'a TorrentDescriptor,
    piece: &PieceRef,
) -> Result<&'a str> {
    let file = descriptor
        .file(&piece.file)
        .ok_or_else(|| unknown_file(&piece.torrent, &piece.file))?;
    file.hashes
        .get(piece.piece as usize)
        .map(String::as_str)
        .ok_or_else(|| {
            SwarmError::protocol(
                ProtocolErrorKind::PieceOutOfRange,
                format!("piece {} of '{}' does not exist", piece.piece, piece.file),
            )
        })
}

type FileKey = (String, String);

/// In-memory storage for testing
#[derive(Debug)]
pub struct MemoryStorage {
    unit_size: usize,
    descriptors: RwLock<HashMap<String, TorrentDescriptor>>,
    complete: RwLock<HashMap<FileKey, Vec<u8>>>,
    partial: RwLock<HashMap<FileKey, HashMap<u32, Bytes>>>,
}

impl MemoryStorage {
    pub fn new(unit_size: usize) -> Self {
        Self {
            unit_size,
            descriptors: RwLock::new(HashMap::new()),
            complete: RwLock::new(HashMap::new()),
            partial: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a torrent whose files are all held
    pub fn add_torrent(&self, id: &str, files: &[(&str, &[u8])]) -> TorrentDescriptor {
        let descriptor = self.describe(id, files);
        let mut complete = self.complete.write();
        for (path, data) in files {
            complete.insert((id.to_string(), path.to_string()), data.to_vec());
        }
        self.descriptors
            .write()
            .insert(id.to_string(), descriptor.clone());
        descriptor
    }

    /// Describe files without storing them (what a downloader would fetch)
    pub fn describe(&self, id: &str, files: &[(&str, &[u8])]) -> TorrentDescriptor {
        let files: Vec<DescriptorFile> = files
            .iter()
            .map(|(path, data)| DescriptorFile {
                path: path.to_string(),
                size: data.len() as u64,
                hashes: split_pieces(data, self.unit_size)
                    .iter()
                    .map(|p| descriptor::piece_hash(p))
                    .collect(),
            })
            .collect();
        TorrentDescriptor {
            id: id.to_string(),
            total_size: files.iter().map(|f| f.size).sum(),
            local_root: PathBuf::from(descriptor::PORTABLE_ROOT),
            files,
        }
    }

    /// Contents of a completed file
    pub fn file_contents(&self, torrent: &str, file: &str) -> Option<Vec<u8>> {
        self.complete
            .read()
            .get(&(torrent.to_string(), file.to_string()))
            .cloned()
    }

    /// Whether a partial download of the file exists
    pub fn has_partial(&self, torrent: &str, file: &str) -> bool {
        self.partial
            .read()
            .contains_key(&(torrent.to_string(), file.to_string()))
    }

    fn descriptor(&self, torrent: &str) -> Result<TorrentDescriptor> {
        self.descriptors
            .read()
            .get(torrent)
            .cloned()
            .ok_or_else(|| unknown_torrent(torrent))
    }
}

/// Cut `data` into pieces; an empty input is one empty piece
pub(crate) fn split_pieces(data: &[u8], unit_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(unit_size).collect()
}

#[async_trait]
impl Storage for MemoryStorage {
    fn unit_size(&self) -> usize {
        self.unit_size
    }

    async fn local_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries: Vec<_> = self.descriptors.read().values().map(catalog_entry).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn files(&self, torrent: &str) -> Result<Vec<(String, u32)>> {
        let descriptor = self.descriptor(torrent)?;
        Ok(descriptor
            .files
            .iter()
            .map(|f| (f.path.clone(), f.piece_count()))
            .collect())
    }

    async fn has_torrent(&self, torrent: &str) -> bool {
        self.descriptors.read().contains_key(torrent)
    }

    async fn descriptor_bytes(&self, torrent: &str) -> Result<Bytes> {
        Ok(Bytes::from(self.descriptor(torrent)?.portable_text()))
    }

    async fn verify_piece(&self, piece: &PieceRef, data: &[u8]) -> Result<bool> {
        let descriptor = self.descriptor(&piece.torrent)?;
        Ok(expected_hash(&descriptor, piece)? == descriptor::piece_hash(data))
    }

    async fn read_piece(&self, piece: &PieceRef) -> Result<Option<Bytes>> {
        let key = (piece.torrent.clone(), piece.file.clone());
        if let Some(data) = self.complete.read().get(&key) {
            return Ok(split_pieces(data, self.unit_size)
                .get(piece.piece as usize)
                .map(|p| Bytes::copy_from_slice(p)));
        }
        Ok(self
            .partial
            .read()
            .get(&key)
            .and_then(|pieces| pieces.get(&piece.piece).cloned()))
    }

    async fn write_piece(&self, piece: &PieceRef, data: &[u8]) -> Result<()> {
        let descriptor = self.descriptor(&piece.torrent)?;
        expected_hash(&descriptor, piece)?;
        self.partial
            .write()
            .entry((piece.torrent.clone(), piece.file.clone()))
            .or_default()
            .insert(piece.piece, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn finish_file(&self, torrent: &str, file: &str) -> Result<()> {
        let descriptor = self.descriptor(torrent)?;
        let count = descriptor
            .file(file)
            .ok_or_else(|| unknown_file(torrent, file))?
            .piece_count();
        let key = (torrent.to_string(), file.to_string());
        let pieces = self.partial.write().remove(&key).unwrap_or_default();

        let mut contents = Vec::new();
        for index in 0..count {
            let piece = pieces.get(&index).ok_or_else(|| {
                SwarmError::Internal(format!("piece {} of '{}' was never written", index, file))
            })?;
            contents.extend_from_slice(piece);
        }
        self.complete.write().insert(key, contents);
        Ok(())
    }

    async fn discard_file(&self, torrent: &str, file: &str) -> Result<()> {
        self.partial
            .write()
            .remove(&(torrent.to_string(), file.to_string()));
        Ok(())
    }

    async fn is_complete(&self, torrent: &str) -> Result<bool> {
        let descriptor = self.descriptor(torrent)?;
        let complete = self.complete.read();
        Ok(descriptor
            .files
            .iter()
            .all(|f| complete.contains_key(&(torrent.to_string(), f.path.clone()))))
    }

    async fn verified_pieces(&self, torrent: &str) -> Result<Vec<PieceRef>> {
        let descriptor = self.descriptor(torrent)?;
        let complete = self.complete.read();
        let mut held = Vec::new();
        for file in &descriptor.files {
            let Some(data) = complete.get(&(torrent.to_string(), file.path.clone())) else {
                continue;
            };
            for (index, piece) in split_pieces(data, self.unit_size).iter().enumerate() {
                if file.hashes.get(index).map(String::as_str) == Some(descriptor::piece_hash(piece).as_str()) {
                    held.push(PieceRef::new(torrent, file.path.clone(), index as u32));
                }
            }
        }
        Ok(held)
    }

    async fn register_descriptor(&self, descriptor: &[u8], destination: &Path) -> Result<String> {
        let text = std::str::from_utf8(descriptor).map_err(|_| {
            SwarmError::protocol(ProtocolErrorKind::InvalidDescriptor, "descriptor is not UTF-8")
        })?;
        let parsed = TorrentDescriptor::parse(text, self.unit_size)?.with_root(destination);
        let id = parsed.id.clone();
        descriptor::check_identifier("id", &id)?;
        self.descriptors.write().insert(id.clone(), parsed);
        Ok(id)
    }

    async fn publish(&self, id: &str, paths: &[PathBuf]) -> Result<()> {
        let descriptor = TorrentDescriptor::generate(id, paths, self.unit_size)?;
        let mut contents = Vec::with_capacity(descriptor.files.len());
        for file in &descriptor.files {
            contents.push((file.path.clone(), std::fs::read(descriptor.file_path(&file.path))?));
        }

        let mut complete = self.complete.write();
        for (path, data) in contents {
            complete.insert((id.to_string(), path), data);
        }
        self.descriptors.write().insert(id.to_string(), descriptor);
        Ok(())
    }

    async fn load_local(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.descriptors.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_seeded_torrent() {
        let storage = MemoryStorage::new(4);
        storage.add_torrent("t", &[("a.bin", b"0123456789")]);

        assert_eq!(storage.files("t").await.unwrap(), vec![("a.bin".to_string(), 3)]);
        let piece = PieceRef::new("t", "a.bin", 2);
        assert_eq!(storage.read_piece(&piece).await.unwrap().unwrap().as_ref(), b"89");
        assert!(storage.verify_piece(&piece, b"89").await.unwrap());
        assert!(!storage.verify_piece(&piece, b"88").await.unwrap());
        assert_eq!(storage.verified_pieces("t").await.unwrap().len(), 3);
        assert!(storage.is_complete("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_download_cycle() {
        let seeder = MemoryStorage::new(4);
        let descriptor = seeder.add_torrent("t", &[("a.bin", b"abcdef")]);

        let leecher = MemoryStorage::new(4);
        let id = leecher
            .register_descriptor(descriptor.portable_text().as_bytes(), Path::new("/dl"))
            .await
            .unwrap();
        assert_eq!(id, "t");
        assert!(!leecher.is_complete("t").await.unwrap());

        leecher.write_piece(&PieceRef::new("t", "a.bin", 1), b"ef").await.unwrap();
        leecher.write_piece(&PieceRef::new("t", "a.bin", 0), b"abcd").await.unwrap();
        assert!(leecher.has_partial("t", "a.bin"));

        leecher.finish_file("t", "a.bin").await.unwrap();
        assert_eq!(leecher.file_contents("t", "a.bin").unwrap(), b"abcdef");
        assert!(leecher.is_complete("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_piece_rejected() {
        let storage = MemoryStorage::new(4);
        storage.add_torrent("t", &[("a.bin", b"abc")]);
        assert!(storage.write_piece(&PieceRef::new("t", "a.bin", 1), b"x").await.is_err());
        assert!(storage.write_piece(&PieceRef::new("t", "b.bin", 0), b"x").await.is_err());
        assert!(storage.read_piece(&PieceRef::new("u", "a.bin", 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_advertises_portable_length() {
        let storage = MemoryStorage::new(4);
        let descriptor = storage.add_torrent("t", &[("a.bin", b"abc"), ("b.bin", b"")]);
        let catalog = storage.local_catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].descriptor_len, descriptor.portable_text().len() as u64);
        assert_eq!(catalog[0].files, vec!["a.bin".to_string(), "b.bin".to_string()]);
    }
}
