//! Object storage over ZIP and TAR archives, plain directories, remote
//! archive URLs and container images.
//!
//! Every backing implements [`ObjectStorage`]: keys are `/`-separated
//! strings, listings are delimiter-style (direct children plus common
//! prefixes), and archive-backed stores rewrite the whole archive on each
//! mutation through a temp file and atomic rename.

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod storage;

pub use archive::{ArchiveCodec, ArchiveEntry, ArchiveFormat};
pub use config::{StoreConfig, open_store};
pub use error::{StoreError, StoreResult};
pub use storage::{
    ArchiveObjectStore, ArchiveStorageManager, ContainerImageObjectStore, FilesystemObjectStore,
    FilesystemStorageManager, Listing, ObjectReader, ObjectStorage, RegistryConfig,
    RemoteArchiveObjectStore, RemoteConfig, StorageManager, StoredObject, StoredPrefix, Tags,
    with_cancellation,
};
