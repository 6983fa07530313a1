//! Store configuration and the factory that opens a store from it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::ArchiveFormat;
use crate::error::{StoreError, StoreResult};
use crate::storage::{
    ArchiveObjectStore, ContainerImageObjectStore, FilesystemObjectStore, ObjectStorage,
    RegistryConfig, RemoteArchiveObjectStore, RemoteConfig,
};

/// Which backing to open.
///
/// Loaded from JSON with a `type` tag, e.g.
/// `{"type": "archive", "path": "data.tar.gz"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Plain files under a directory.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// A local archive file.
    Archive {
        path: PathBuf,
        /// Detected from the file name when absent.
        #[serde(default)]
        format: Option<ArchiveFormat>,
    },
    /// An archive downloaded from a URL (read-only).
    Remote(RemoteConfig),
    /// A container image pulled from a registry (read-only).
    ContainerImage(RegistryConfig),
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> StoreResult<Self> {
        let config: StoreConfig = serde_json::from_str(json)
            .map_err(|e| StoreError::Config(format!("invalid store config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| StoreError::io_at("read", path, e))?;
        Self::from_json_str(&json)
    }

    /// Guess a backing from a bare target: URLs are remote archives,
    /// existing directories and suffix-less paths are filesystem stores,
    /// anything else is a local archive.
    pub fn from_target(target: &str) -> Self {
        if target.starts_with("http://") || target.starts_with("https://") {
            return StoreConfig::Remote(RemoteConfig::new(target));
        }

        let path = PathBuf::from(target);
        let format = ArchiveFormat::from_path(target);
        if path.is_dir() || (format.is_none() && path.extension().is_none()) {
            StoreConfig::Filesystem { path }
        } else {
            StoreConfig::Archive { path, format }
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        match self {
            StoreConfig::Filesystem { path } | StoreConfig::Archive { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(StoreError::Config("path must not be empty".to_string()));
                }
                Ok(())
            }
            StoreConfig::Remote(remote) => remote.validate(),
            StoreConfig::ContainerImage(registry) => registry.validate(),
        }
    }

    /// Short name of the backing kind
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Filesystem { .. } => "filesystem",
            StoreConfig::Archive { .. } => "archive",
            StoreConfig::Remote(_) => "remote",
            StoreConfig::ContainerImage(_) => "container_image",
        }
    }
}

/// Create an object store from configuration.
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn ObjectStorage>> {
    config.validate()?;

    let store: Arc<dyn ObjectStorage> = match config {
        StoreConfig::Filesystem { path } => Arc::new(FilesystemObjectStore::new(path).await?),
        StoreConfig::Archive { path, format } => match format {
            Some(format) => Arc::new(ArchiveObjectStore::new(path, *format)?),
            None => Arc::new(ArchiveObjectStore::open(path)?),
        },
        StoreConfig::Remote(remote) => Arc::new(RemoteArchiveObjectStore::new(remote.clone())?),
        StoreConfig::ContainerImage(registry) => {
            Arc::new(ContainerImageObjectStore::new(registry.clone())?)
        }
    };

    tracing::debug!(kind = config.kind(), backend = store.backend_name(), "Opened store");
    Ok(store)
}
