//! Torrent descriptors
//!
//! A descriptor is newline-separated UTF-8 text:
//!
//! ```text
//! <torrent id>
//! <total size in bytes>
//! <local root directory>
//! <file size>            \
//! <relative path>         | once per file
//! <sha1 hex of piece 0>   |
//! ...                    /
//! ```
//!
//! Pieces are `unit_size` bytes; the last one of a file may be shorter and an
//! empty file still has one (empty) piece. The copy sent over the wire uses
//! `.` as its root so every holder serves the same bytes.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{ProtocolErrorKind, Result, StorageErrorKind, SwarmError};
use crate::message::{MAX_IDENTIFIER_LEN, SEPARATOR};

/// Root written into the wire form of a descriptor
pub const PORTABLE_ROOT: &str = ".";

/// Lowercase hex SHA-1 of a piece
pub fn piece_hash(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pieces needed for `size` bytes; never zero. None if the count does not
/// fit a piece index.
pub fn piece_count(size: u64, unit_size: usize) -> Option<u32> {
    u32::try_from(size.div_ceil(unit_size as u64).max(1)).ok()
}

/// Length of piece `index` of a `size`-byte file
pub fn piece_len(size: u64, index: u32, unit_size: usize) -> usize {
    let start = index as u64 * unit_size as u64;
    size.saturating_sub(start).min(unit_size as u64) as usize
}

/// Reject identifiers the wire format cannot carry
pub fn check_identifier(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(SwarmError::invalid_input(
            field,
            format!("must be 1..={} bytes, got {}", MAX_IDENTIFIER_LEN, value.len()),
        ));
    }
    let has_separator = value
        .as_bytes()
        .windows(SEPARATOR.len())
        .any(|window| window == SEPARATOR);
    if value.contains('\n') || has_separator {
        return Err(SwarmError::invalid_input(
            field,
            format!("'{}' contains a reserved sequence", value),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorFile {
    /// Path relative to the torrent root, `/`-separated
    pub path: String,
    pub size: u64,
    pub hashes: Vec<String>,
}

impl DescriptorFile {
    pub fn piece_count(&self) -> u32 {
        self.hashes.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub id: String,
    pub total_size: u64,
    pub local_root: PathBuf,
    pub files: Vec<DescriptorFile>,
}

impl TorrentDescriptor {
    /// Parse descriptor text, checking hash counts against `unit_size`
    pub fn parse(text: &str, unit_size: usize) -> Result<Self> {
        let mut lines = text.lines();
        let mut next = |what: &str| {
            lines.next().ok_or_else(|| invalid(format!("missing {}", what)))
        };

        let id = next("torrent id")?.to_string();
        let total_size: u64 = next("total size")?
            .parse()
            .map_err(|_| invalid("total size is not a number"))?;
        let local_root = PathBuf::from(next("local root")?);

        let mut files = Vec::new();
        let mut sum = 0u64;
        while let Some(size_line) = lines.next() {
            if size_line.is_empty() {
                continue;
            }
            let size: u64 = size_line
                .parse()
                .map_err(|_| invalid(format!("file size '{}' is not a number", size_line)))?;
            let path = lines
                .next()
                .ok_or_else(|| invalid("missing file path"))?
                .to_string();
            check_relative(&path)?;
            check_identifier("file", &path)?;

            let count = piece_count(size, unit_size)
                .ok_or_else(|| invalid(format!("'{}' has too many pieces", path)))?;
            let mut hashes = Vec::new();
            for _ in 0..count {
                let hash = lines
                    .next()
                    .ok_or_else(|| invalid(format!("'{}' lists fewer than {} hashes", path, count)))?;
                if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(invalid(format!("'{}' has a malformed hash", path)));
                }
                hashes.push(hash.to_ascii_lowercase());
            }

            sum = sum
                .checked_add(size)
                .ok_or_else(|| invalid("file sizes overflow"))?;
            files.push(DescriptorFile { path, size, hashes });
        }

        if sum != total_size {
            return Err(invalid(format!(
                "total size {} does not match file sizes {}",
                total_size, sum
            )));
        }

        Ok(Self {
            id,
            total_size,
            local_root,
            files,
        })
    }

    /// Serialize with the local root
    pub fn to_text(&self) -> String {
        self.render(&self.local_root.to_string_lossy())
    }

    /// Serialize with the portable root
    pub fn portable_text(&self) -> String {
        self.render(PORTABLE_ROOT)
    }

    fn render(&self, root: &str) -> String {
        let mut out = format!("{}\n{}\n{}\n", self.id, self.total_size, root);
        for file in &self.files {
            out.push_str(&format!("{}\n{}\n", file.size, file.path));
            for hash in &file.hashes {
                out.push_str(hash);
                out.push('\n');
            }
        }
        out
    }

    pub fn file(&self, path: &str) -> Option<&DescriptorFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Absolute location of a file on this peer
    pub fn file_path(&self, path: &str) -> PathBuf {
        self.local_root.join(path)
    }

    /// Relocate under `root`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = root.into();
        self
    }

    /// Hash every piece of `paths` (files or directories, walked
    /// recursively). The root is the deepest directory containing them all.
    pub fn generate(id: &str, paths: &[PathBuf], unit_size: usize) -> Result<Self> {
        check_identifier("id", id)?;
        if paths.is_empty() {
            return Err(SwarmError::invalid_input("paths", "no files given"));
        }

        let mut found = Vec::new();
        for path in paths {
            collect_files(path, &mut found)?;
        }
        found.sort();
        found.dedup();
        if found.is_empty() {
            return Err(SwarmError::invalid_input("paths", "no regular files found"));
        }

        let root = common_parent(&found);
        let mut files = Vec::with_capacity(found.len());
        let mut total_size = 0;

        for absolute in &found {
            let relative = relative_name(&root, absolute)?;
            check_identifier("file", &relative)?;
            let (size, hashes) = hash_file(absolute, unit_size)?;
            total_size += size;
            files.push(DescriptorFile {
                path: relative,
                size,
                hashes,
            });
        }

        tracing::debug!("Generated descriptor '{}' with {} files", id, files.len());

        Ok(Self {
            id: id.to_string(),
            total_size,
            local_root: root,
            files,
        })
    }
}

fn invalid(message: impl Into<String>) -> SwarmError {
    SwarmError::protocol(ProtocolErrorKind::InvalidDescriptor, message)
}

/// Descriptor paths must stay inside the torrent root
fn check_relative(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(SwarmError::storage(
            StorageErrorKind::PathTraversal,
            candidate,
            "file path leaves the torrent root",
        ));
    }
    Ok(())
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        SwarmError::storage(StorageErrorKind::NotFound, path, e.to_string())
    })?;

    if metadata.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for entry in entries {
            collect_files(&entry, out)?;
        }
    } else if metadata.is_file() {
        out.push(std::fs::canonicalize(path)?);
    }
    Ok(())
}

fn common_parent(files: &[PathBuf]) -> PathBuf {
    let mut root: Vec<Component<'_>> = files[0]
        .parent()
        .map(|p| p.components().collect())
        .unwrap_or_default();

    for file in &files[1..] {
        let parent: Vec<_> = file
            .parent()
            .map(|p| p.components().collect())
            .unwrap_or_default();
        let shared = root
            .iter()
            .zip(parent.iter())
            .take_while(|(a, b)| a == b)
            .count();
        root.truncate(shared);
    }

    root.iter().collect()
}

fn relative_name(root: &Path, file: &Path) -> Result<String> {
    let relative = file.strip_prefix(root).map_err(|_| {
        SwarmError::storage(StorageErrorKind::InvalidPath, file, "not under the torrent root")
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn hash_file(path: &Path, unit_size: usize) -> Result<(u64, Vec<String>)> {
    let mut file = File::open(path)
        .map_err(|e| SwarmError::storage(StorageErrorKind::Io, path, e.to_string()))?;
    let mut buf = vec![0u8; unit_size];
    let mut hashes = Vec::new();
    let mut size = 0u64;

    loop {
        let filled = read_full(&mut file, &mut buf)?;
        if filled == 0 && !hashes.is_empty() {
            break;
        }
        hashes.push(piece_hash(&buf[..filled]));
        size += filled as u64;
        if filled < unit_size {
            break;
        }
    }

    Ok((size, hashes))
}

/// Fill `buf` unless EOF comes first
fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
