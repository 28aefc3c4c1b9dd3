//! Filesystem storage
//!
//! Descriptors live as `<torrents_dir>/<id>.torrent` with their local root
//! written in. Files being downloaded are written piece by piece into
//! `<name>.part` next to their final location and renamed once complete.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{catalog_entry, expected_hash, unknown_file, unknown_torrent, Storage};
use crate::catalog::CatalogEntry;
use crate::descriptor::{self, TorrentDescriptor};
use crate::error::{ProtocolErrorKind, Result, StorageErrorKind, SwarmError};
use crate::message::PieceRef;

/// Descriptor file extension
pub const DESCRIPTOR_EXTENSION: &str = "torrent";

/// Disk-backed storage
pub struct FsStorage {
    unit_size: usize,
    torrents_dir: PathBuf,
    descriptors: RwLock<HashMap<String, TorrentDescriptor>>,
}

impl FsStorage {
    /// Create storage keeping descriptors under `torrents_dir`
    pub async fn new(torrents_dir: impl Into<PathBuf>, unit_size: usize) -> Result<Self> {
        let torrents_dir = torrents_dir.into();
        tokio::fs::create_dir_all(&torrents_dir).await.map_err(|e| {
            SwarmError::storage(StorageErrorKind::Io, &torrents_dir, e.to_string())
        })?;

        Ok(Self {
            unit_size,
            torrents_dir,
            descriptors: RwLock::new(HashMap::new()),
        })
    }

    /// Adopt a descriptor file from disk; returns its torrent ID
    pub async fn load_descriptor(&self, path: &Path) -> Result<String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SwarmError::storage(StorageErrorKind::NotFound, path, e.to_string()))?;
        let descriptor = TorrentDescriptor::parse(&text, self.unit_size)?;
        let id = descriptor.id.clone();
        descriptor::check_identifier("id", &id)?;

        tracing::debug!("Loaded descriptor '{}' from {}", id, path.display());
        self.descriptors.write().insert(id.clone(), descriptor);
        Ok(id)
    }

    fn descriptor_path(&self, id: &str) -> PathBuf {
        self.torrents_dir
            .join(format!("{}.{}", id, DESCRIPTOR_EXTENSION))
    }

    async fn persist(&self, descriptor: &TorrentDescriptor) -> Result<()> {
        let path = self.descriptor_path(&descriptor.id);
        tokio::fs::write(&path, descriptor.to_text())
            .await
            .map_err(|e| SwarmError::storage(StorageErrorKind::Io, &path, e.to_string()))
    }

    fn descriptor(&self, torrent: &str) -> Result<TorrentDescriptor> {
        self.descriptors
            .read()
            .get(torrent)
            .cloned()
            .ok_or_else(|| unknown_torrent(torrent))
    }

    /// Final path, byte offset and length of a piece
    fn locate(&self, piece: &PieceRef) -> Result<(PathBuf, u64, usize)> {
        let descriptor = self.descriptor(&piece.torrent)?;
        expected_hash(&descriptor, piece)?;
        let file = descriptor
            .file(&piece.file)
            .ok_or_else(|| unknown_file(&piece.torrent, &piece.file))?;

        let offset = piece.piece as u64 * self.unit_size as u64;
        let len = descriptor::piece_len(file.size, piece.piece, self.unit_size);
        Ok((descriptor.file_path(&piece.file), offset, len))
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Read `len` bytes at `offset`; `None` when the file is missing or short
async fn read_at(path: &Path, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    match file.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(buf)),
        Err(_) => Ok(None),
    }
}

#[async_trait]
impl Storage for FsStorage {
    fn unit_size(&self) -> usize {
        self.unit_size
    }

    async fn local_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries: Vec<_> = self.descriptors.read().values().map(catalog_entry).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn files(&self, torrent: &str) -> Result<Vec<(String, u32)>> {
        Ok(self
            .descriptor(torrent)?
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
        let (path, offset, len) = match self.locate(piece) {
            Ok(location) => location,
            Err(_) => return Ok(None),
        };

        if let Some(data) = read_at(&path, offset, len).await? {
            return Ok(Some(Bytes::from(data)));
        }
        Ok(read_at(&part_path(&path), offset, len).await?.map(Bytes::from))
    }

    async fn write_piece(&self, piece: &PieceRef, data: &[u8]) -> Result<()> {
        let (path, offset, _) = self.locate(piece)?;
        let part = part_path(&path);

        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Pieces arrive out of order; never truncate
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part)
            .await
            .map_err(|e| SwarmError::storage(StorageErrorKind::Io, &part, e.to_string()))?;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finish_file(&self, torrent: &str, file: &str) -> Result<()> {
        let descriptor = self.descriptor(torrent)?;
        let entry = descriptor
            .file(file)
            .ok_or_else(|| unknown_file(torrent, file))?;
        let path = descriptor.file_path(file);
        let part = part_path(&path);

        // Empty files never get a piece written
        if entry.size == 0 && tokio::fs::metadata(&part).await.is_err() {
            if let Some(parent) = part.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            File::create(&part).await?;
        }

        tokio::fs::rename(&part, &path)
            .await
            .map_err(|e| SwarmError::storage(StorageErrorKind::Io, &path, e.to_string()))
    }

    async fn discard_file(&self, torrent: &str, file: &str) -> Result<()> {
        let path = part_path(&self.descriptor(torrent)?.file_path(file));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SwarmError::storage(StorageErrorKind::Io, &path, e.to_string())),
        }
    }

    async fn is_complete(&self, torrent: &str) -> Result<bool> {
        let descriptor = self.descriptor(torrent)?;
        for file in &descriptor.files {
            if tokio::fs::metadata(descriptor.file_path(&file.path)).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn verified_pieces(&self, torrent: &str) -> Result<Vec<PieceRef>> {
        let descriptor = self.descriptor(torrent)?;
        let mut held = Vec::new();

        for file in &descriptor.files {
            let path = descriptor.file_path(&file.path);
            for (index, hash) in file.hashes.iter().enumerate() {
                let index = index as u32;
                let offset = index as u64 * self.unit_size as u64;
                let len = descriptor::piece_len(file.size, index, self.unit_size);
                let Some(data) = read_at(&path, offset, len).await? else {
                    break;
                };
                if *hash == descriptor::piece_hash(&data) {
                    held.push(PieceRef::new(torrent, file.path.clone(), index));
                }
            }
        }

        Ok(held)
    }

    async fn register_descriptor(&self, descriptor: &[u8], destination: &Path) -> Result<String> {
        let text = std::str::from_utf8(descriptor).map_err(|_| {
            SwarmError::protocol(ProtocolErrorKind::InvalidDescriptor, "descriptor is not UTF-8")
        })?;

        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            SwarmError::storage(StorageErrorKind::Io, destination, e.to_string())
        })?;
        let root = tokio::fs::canonicalize(destination).await?;

        let parsed = TorrentDescriptor::parse(text, self.unit_size)?.with_root(root);
        descriptor::check_identifier("id", &parsed.id)?;
        self.persist(&parsed).await?;

        let id = parsed.id.clone();
        tracing::info!("Registered torrent '{}' at {}", id, parsed.local_root.display());
        self.descriptors.write().insert(id.clone(), parsed);
        Ok(id)
    }

    async fn publish(&self, id: &str, paths: &[PathBuf]) -> Result<()> {
        let id_owned = id.to_string();
        let paths = paths.to_vec();
        let unit_size = self.unit_size;
        let descriptor = tokio::task::spawn_blocking(move || {
            TorrentDescriptor::generate(&id_owned, &paths, unit_size)
        })
        .await??;

        self.persist(&descriptor).await?;
        tracing::info!(
            "Published '{}' ({} files, {} bytes)",
            id,
            descriptor.files.len(),
            descriptor.total_size
        );
        self.descriptors.write().insert(id.to_string(), descriptor);
        Ok(())
    }

    async fn load_local(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.torrents_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SwarmError::storage(
                    StorageErrorKind::Io,
                    &self.torrents_dir,
                    e.to_string(),
                ))
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == DESCRIPTOR_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut ids = Vec::new();
        for path in paths {
            match self.load_descriptor(&path).await {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(ids)
    }
}
