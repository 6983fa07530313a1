pub mod tar;
pub mod zip;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::paths::{MAX_ENTRY_SIZE, check_entry_size};

pub use self::tar::{TarCodec, TarCompression};
pub use self::zip::ZipCodec;

/// Archive formats that can back an object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    /// Detect archive format from file extension
    pub fn from_path(path: &str) -> Option<Self> {
        let path_lower = path.to_lowercase();
        if path_lower.ends_with(".tar.gz") || path_lower.ends_with(".tgz") {
            return Some(ArchiveFormat::TarGz);
        }
        if path_lower.ends_with(".tar.bz2") || path_lower.ends_with(".tbz2") {
            return Some(ArchiveFormat::TarBz2);
        }
        if path_lower.ends_with(".tar") {
            return Some(ArchiveFormat::Tar);
        }
        if path_lower.ends_with(".zip") {
            return Some(ArchiveFormat::Zip);
        }
        // A bare compression suffix is assumed to wrap a tar stream
        if path_lower.ends_with(".gz") {
            return Some(ArchiveFormat::TarGz);
        }
        if path_lower.ends_with(".bz2") {
            return Some(ArchiveFormat::TarBz2);
        }
        None
    }

    /// Detect archive format from the first bytes of the file
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Some(ArchiveFormat::Zip);
        }
        if header.starts_with(&[0x1f, 0x8b]) {
            return Some(ArchiveFormat::TarGz);
        }
        if header.starts_with(b"BZh") {
            return Some(ArchiveFormat::TarBz2);
        }
        // USTAR magic lives at offset 257 of the first header block
        if header.len() >= 262 && &header[257..262] == b"ustar" {
            return Some(ArchiveFormat::Tar);
        }
        None
    }

    /// Sniff the format of a file on disk from its leading bytes
    pub fn detect_file(path: &Path) -> StoreResult<Option<Self>> {
        let mut file = File::open(path).map_err(|e| StoreError::io_at("open", path, e))?;
        let mut header = [0u8; 512];
        let mut filled = 0;
        // Short files are fine, read until EOF or the block is full
        while filled < header.len() {
            let n = file
                .read(&mut header[filled..])
                .map_err(|e| StoreError::io_at("read", path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Self::from_magic(&header[..filled]))
    }

    /// Canonical file extension, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarBz2 => ".tar.bz2",
        }
    }

    /// Codec that reads and rewrites archives of this format
    pub fn codec(&self) -> Arc<dyn ArchiveCodec> {
        match self {
            ArchiveFormat::Zip => Arc::new(ZipCodec::new()),
            ArchiveFormat::Tar => Arc::new(TarCodec::new(TarCompression::None)),
            ArchiveFormat::TarGz => Arc::new(TarCodec::new(TarCompression::Gzip)),
            ArchiveFormat::TarBz2 => Arc::new(TarCodec::new(TarCompression::Bzip2)),
        }
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        };
        f.write_str(name)
    }
}

impl FromStr for ArchiveFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_start_matches('.') {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "tar.gz" | "tgz" | "tar_gz" | "targz" => Ok(ArchiveFormat::TarGz),
            "tar.bz2" | "tbz2" | "tar_bz2" | "tarbz2" => Ok(ArchiveFormat::TarBz2),
            other => Err(StoreError::Config(format!("unknown archive format: {other}"))),
        }
    }
}

/// One file or directory inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: Option<DateTime<Utc>>,
    /// Entry bytes. `None` for directories and for header-only scans.
    pub content: Option<Bytes>,
}

impl ArchiveEntry {
    /// A regular file entry, stamped with the current time
    pub fn file(name: impl Into<String>, content: Bytes) -> Self {
        ArchiveEntry {
            name: name.into(),
            size: content.len() as u64,
            is_dir: false,
            mod_time: Some(Utc::now()),
            content: Some(content),
        }
    }

    /// A directory marker; the name always ends with `/`
    pub fn directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        ArchiveEntry {
            name,
            size: 0,
            is_dir: true,
            mod_time: Some(Utc::now()),
            content: None,
        }
    }

    /// Header-only view of an entry, as produced by index scans
    pub fn header(name: String, size: u64, is_dir: bool, mod_time: Option<DateTime<Utc>>) -> Self {
        ArchiveEntry {
            name,
            size,
            is_dir,
            mod_time,
            content: None,
        }
    }

    /// Entry content, empty for directories
    pub fn bytes(&self) -> Bytes {
        self.content.clone().unwrap_or_default()
    }
}

/// Whole-archive read and rewrite operations for one format.
///
/// All methods are blocking and are expected to run on a blocking thread.
pub trait ArchiveCodec: Send + Sync {
    /// Format this codec reads and writes
    fn format(&self) -> ArchiveFormat;

    /// Read every entry with its content, in archive order.
    /// A missing or empty file is an empty archive.
    fn read_all(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>>;

    /// Read every entry header without materializing content
    fn read_index(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>>;

    /// Find a single entry by exact name and read its content
    fn read_entry(&self, path: &Path, name: &str) -> StoreResult<Option<ArchiveEntry>>;

    /// Replace the archive at `path` with exactly `entries`.
    ///
    /// The new archive is built in a temp file next to `path` and renamed over
    /// it. If `abort` fires before the rename, nothing durable changes.
    fn write_all(
        &self,
        path: &Path,
        entries: &[ArchiveEntry],
        abort: &CancellationToken,
    ) -> StoreResult<()>;
}

/// Open an archive for reading, `None` if it does not exist or is empty
pub(crate) fn open_existing(path: &Path) -> StoreResult<Option<File>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io_at("open", path, e)),
    };

    let len = file
        .metadata()
        .map_err(|e| StoreError::io_at("stat", path, e))?
        .len();
    if len == 0 {
        return Ok(None);
    }

    Ok(Some(file))
}

/// Read an entry's bytes through a reader capped just above the size limit
pub(crate) fn read_bounded<R: Read>(
    reader: R,
    archive: &Path,
    name: &str,
    declared: u64,
) -> StoreResult<Bytes> {
    // Never trust the declared size for the allocation
    let mut buf = Vec::with_capacity(declared.min(64 * 1024) as usize);
    reader
        .take(MAX_ENTRY_SIZE + 1)
        .read_to_end(&mut buf)
        .map_err(|e| read_error(archive, e))?;

    check_entry_size(name, buf.len() as u64)?;
    Ok(Bytes::from(buf))
}

/// Decompression and framing problems surface as `InvalidData`/`UnexpectedEof`
pub(crate) fn read_error(archive: &Path, err: std::io::Error) -> StoreError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            StoreError::bad_format(archive, err)
        }
        _ => StoreError::io_at("read", archive, err),
    }
}

/// Enforce the entry invariants before anything is written
pub(crate) fn check_entries(entries: &[ArchiveEntry]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if entry.name.is_empty() {
            return Err(StoreError::InvalidKey("entry name must not be empty".to_string()));
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(StoreError::InvalidKey(format!(
                "duplicate entry name: {}",
                entry.name
            )));
        }
        if entry.is_dir {
            if !entry.name.ends_with('/') {
                return Err(StoreError::InvalidKey(format!(
                    "directory entry must end with '/': {}",
                    entry.name
                )));
            }
        } else {
            let len = entry.content.as_ref().map(|c| c.len()).unwrap_or(0) as u64;
            check_entry_size(&entry.name, len)?;
        }
    }
    Ok(())
}
