//! The object storage contract shared by every backing.
//!
//! A caller written against one [`ObjectStorage`] can be pointed at any other
//! (filesystem directory, local archive, remote archive, container image)
//! through `Arc<dyn ObjectStorage>`.

pub mod archive;
pub mod filesystem;
pub mod image;
pub mod manager;
pub mod remote;

pub use archive::ArchiveObjectStore;
pub use filesystem::FilesystemObjectStore;
pub use image::{ContainerImageObjectStore, RegistryConfig};
pub use manager::{ArchiveStorageManager, FilesystemStorageManager, StorageManager};
pub use remote::{RemoteArchiveObjectStore, RemoteConfig};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::paths::{MAX_ENTRY_SIZE, Placement, check_entry_size, place, validate_key};

/// User-supplied key/value metadata attached to an upload
pub type Tags = HashMap<String, String>;

/// Sequential reader over an object's content; dropping it closes it
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Stream of objects produced by a listing
pub type ObjectStream = Pin<Box<dyn Stream<Item = StoreResult<StoredObject>> + Send>>;

/// Stream of common prefixes produced by a listing
pub type PrefixStream = Pin<Box<dyn Stream<Item = StoreResult<StoredPrefix>> + Send>>;

/// An object as reported by `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub tags: Tags,
    /// Hex digest of the content, when the backing records one
    pub hash: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A synthesized sub-directory; the key always ends in `/`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoredPrefix {
    pub key: String,
}

/// Result of a `list` call: direct children as objects plus the immediate
/// sub-directories as prefixes.
pub struct Listing {
    pub objects: ObjectStream,
    pub prefixes: PrefixStream,
}

impl Listing {
    pub fn from_parts(objects: Vec<StoredObject>, prefixes: Vec<StoredPrefix>) -> Self {
        Listing {
            objects: futures::stream::iter(objects.into_iter().map(Ok)).boxed(),
            prefixes: futures::stream::iter(prefixes.into_iter().map(Ok)).boxed(),
        }
    }

    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), Vec::new())
    }

    /// Drain both streams
    pub async fn collect(self) -> StoreResult<(Vec<StoredObject>, Vec<StoredPrefix>)> {
        let objects = self.objects.try_collect().await?;
        let prefixes = self.prefixes.try_collect().await?;
        Ok((objects, prefixes))
    }
}

impl std::fmt::Debug for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listing").finish_non_exhaustive()
    }
}

/// Accumulates flat keys into a one-level listing under a prefix.
///
/// Output is sorted and each key appears at most once across objects and
/// prefixes. When the same object key is added twice the later one wins.
#[derive(Debug)]
pub struct ListingBuilder {
    prefix: String,
    objects: BTreeMap<String, StoredObject>,
    prefixes: BTreeSet<String>,
}

impl ListingBuilder {
    pub fn new(prefix: &str) -> Self {
        ListingBuilder {
            prefix: prefix.to_string(),
            objects: BTreeMap::new(),
            prefixes: BTreeSet::new(),
        }
    }

    /// Offer one entry of the backing to the listing
    pub fn add(
        &mut self,
        key: &str,
        size: u64,
        is_dir: bool,
        last_modified: Option<DateTime<Utc>>,
    ) {
        match place(&self.prefix, key, is_dir) {
            Placement::Object => {
                self.objects.insert(
                    key.to_string(),
                    StoredObject {
                        key: key.to_string(),
                        size,
                        tags: Tags::new(),
                        hash: None,
                        last_modified,
                    },
                );
            }
            Placement::Prefix(common) => {
                if !self.prefixes.contains(common) {
                    self.prefixes.insert(common.to_string());
                }
            }
            Placement::Outside => {}
        }
    }

    pub fn build(self) -> Listing {
        Listing::from_parts(
            self.objects.into_values().collect(),
            self.prefixes
                .into_iter()
                .map(|key| StoredPrefix { key })
                .collect(),
        )
    }
}

/// Reader over an in-memory buffer
pub fn bytes_reader(content: Bytes) -> ObjectReader {
    Box::new(std::io::Cursor::new(content))
}

/// The read/write/list/delete contract implemented by every store.
///
/// Keys are compared byte-for-byte; `foo` and `foo/` are distinct keys and a
/// trailing `/` marks a directory marker with no content.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under `key`, replacing any previous object.
    /// Directory keys create an empty marker and ignore `data`.
    async fn upload(&self, key: &str, data: Bytes, tags: Tags) -> StoreResult<()>;

    /// Upload from a reader, reading at most one byte past the size cap
    async fn upload_reader(&self, key: &str, reader: ObjectReader, tags: Tags) -> StoreResult<()> {
        validate_key(key)?;

        let mut buf = Vec::new();
        reader
            .take(MAX_ENTRY_SIZE + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StoreError::io(format!("read upload body for {key}"), e))?;
        check_entry_size(key, buf.len() as u64)?;

        self.upload(key, Bytes::from(buf), tags).await
    }

    /// Open the object's content for reading
    async fn download(&self, key: &str) -> StoreResult<ObjectReader>;

    /// Read the whole object into memory
    async fn download_bytes(&self, key: &str) -> StoreResult<Bytes> {
        let mut reader = self.download(key).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StoreError::io(format!("read {key}"), e))?;
        Ok(Bytes::from(buf))
    }

    /// Whether an entry named exactly `key` exists
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List objects directly under `prefix` and the immediate sub-directories,
    /// using `/` as the delimiter.
    async fn list(&self, prefix: &str) -> StoreResult<Listing>;

    /// Attach tags to an existing object. Backings without per-entry
    /// metadata only check that the object exists.
    async fn update_metadata(&self, key: &str, tags: Tags) -> StoreResult<()>;

    /// Release held resources. Safe to call more than once.
    async fn close(&self) -> StoreResult<()>;

    /// Short name of the backing, used in log fields
    fn backend_name(&self) -> &'static str;
}

/// Run `operation` until it finishes or `token` fires, whichever is first.
///
/// Losing the race drops the operation's future, which is how every store
/// observes cancellation: archive rewrites that have not reached their final
/// rename leave no trace.
pub async fn with_cancellation<T, F>(token: &CancellationToken, operation: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StoreError::Cancelled),
        result = operation => result,
    }
}
