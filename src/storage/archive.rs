//! Object store backed by a single local archive file.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::archive::{ArchiveCodec, ArchiveEntry, ArchiveFormat, TarCompression};
use crate::error::{StoreError, StoreResult};
use crate::paths::{absolute, check_entry_size, is_directory_key, validate_key};

use super::{Listing, ListingBuilder, ObjectReader, ObjectStorage, Tags, bytes_reader};

/// Object store whose every object is an entry in one ZIP or TAR archive.
///
/// Each mutation reads the whole archive, edits the entry list in memory and
/// writes a complete replacement next to the original before renaming it
/// into place. Readers share a lock that writers hold exclusively, so a
/// reader never sees a half-written archive.
pub struct ArchiveObjectStore {
    path: PathBuf,
    format: ArchiveFormat,
    codec: Arc<dyn ArchiveCodec>,
    lock: Arc<RwLock<()>>,
}

impl ArchiveObjectStore {
    /// Create a store over `path` with an explicit format.
    ///
    /// The archive itself is created lazily by the first write; its parent
    /// directory is created now.
    pub fn new(path: impl AsRef<Path>, format: ArchiveFormat) -> StoreResult<Self> {
        let path = absolute(path.as_ref())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io_at("create directory", parent, e))?;
        }

        Ok(ArchiveObjectStore {
            codec: format.codec(),
            path,
            format,
            lock: Arc::new(RwLock::new(())),
        })
    }

    /// Pick the format from the file name, falling back to ZIP
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let format =
            ArchiveFormat::from_path(&path.to_string_lossy()).unwrap_or(ArchiveFormat::Zip);
        Self::new(path, format)
    }

    pub fn zip(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::new(path, ArchiveFormat::Zip)
    }

    /// TAR store; gzip or bzip2 compression follows the file suffix
    pub fn tar(path: impl AsRef<Path>) -> StoreResult<Self> {
        let format = match TarCompression::from_path(path.as_ref()) {
            TarCompression::None => ArchiveFormat::Tar,
            TarCompression::Gzip => ArchiveFormat::TarGz,
            TarCompression::Bzip2 => ArchiveFormat::TarBz2,
        };
        Self::new(path, format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Run a read-only codec call on a blocking thread under the shared lock
    async fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn ArchiveCodec, &Path) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.lock).read_owned().await;
        let codec = Arc::clone(&self.codec);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(codec.as_ref(), &path)
        })
        .await?
    }

    /// Read every entry, apply `edit`, and write the result back atomically.
    ///
    /// The exclusive guard moves into the blocking task, so it is held until
    /// the rewrite finishes even if the caller stops waiting. Dropping the
    /// caller's future fires the abort token, which stops the rewrite before
    /// its final rename.
    async fn rewrite<F>(&self, edit: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Vec<ArchiveEntry>) -> StoreResult<()> + Send + 'static,
    {
        let guard = Arc::clone(&self.lock).write_owned().await;
        let codec = Arc::clone(&self.codec);
        let path = self.path.clone();
        let abort = CancellationToken::new();
        let _abort_on_drop = abort.clone().drop_guard();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut entries = dedupe(codec.read_all(&path)?);
            edit(&mut entries)?;
            codec.write_all(&path, &entries, &abort)
        })
        .await?
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.read(move |codec, path| {
            Ok(codec.read_index(path)?.iter().any(|entry| entry.name == key))
        })
        .await
    }
}

/// Keep only the last entry for each name, preserving archive order
fn dedupe(entries: Vec<ArchiveEntry>) -> Vec<ArchiveEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut kept: Vec<ArchiveEntry> = entries
        .into_iter()
        .rev()
        .filter(|entry| seen.insert(entry.name.clone()))
        .collect();
    kept.reverse();
    kept
}

#[async_trait]
impl ObjectStorage for ArchiveObjectStore {
    #[instrument(skip(self, data, _tags), fields(backend = "archive", size = data.len()))]
    async fn upload(&self, key: &str, data: Bytes, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;

        let entry = if is_directory_key(key) {
            ArchiveEntry::directory(key)
        } else {
            check_entry_size(key, data.len() as u64)?;
            ArchiveEntry::file(key, data)
        };

        self.rewrite(move |entries| {
            match entries.iter_mut().find(|existing| existing.name == entry.name) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
            Ok(())
        })
        .await?;

        tracing::debug!(archive = %self.path.display(), key, "Stored object");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "archive"))]
    async fn download(&self, key: &str) -> StoreResult<ObjectReader> {
        validate_key(key)?;

        let name = key.to_string();
        let entry = self
            .read(move |codec, path| codec.read_entry(path, &name))
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        Ok(bytes_reader(entry.bytes()))
    }

    #[instrument(skip(self), fields(backend = "archive"))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        self.contains(key).await
    }

    #[instrument(skip(self), fields(backend = "archive"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;

        let name = key.to_string();
        self.rewrite(move |entries| {
            let before = entries.len();
            entries.retain(|entry| entry.name != name);
            if entries.len() == before {
                return Err(StoreError::NotFound(name));
            }
            Ok(())
        })
        .await?;

        tracing::debug!(archive = %self.path.display(), key, "Deleted object");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "archive"))]
    async fn list(&self, prefix: &str) -> StoreResult<Listing> {
        let prefix = prefix.to_string();
        self.read(move |codec, path| {
            let mut builder = ListingBuilder::new(&prefix);
            for entry in codec.read_index(path)? {
                builder.add(&entry.name, entry.size, entry.is_dir, entry.mod_time);
            }
            Ok(builder.build())
        })
        .await
    }

    #[instrument(skip(self, _tags), fields(backend = "archive"))]
    async fn update_metadata(&self, key: &str, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        if !self.contains(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "archive"
    }
}
