//! Named storage areas, each backed by its own object store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::archive::ArchiveFormat;
use crate::error::{StoreError, StoreResult};
use crate::paths::is_temp_name;

use super::{ArchiveObjectStore, FilesystemObjectStore, ObjectStorage};

/// Creates, opens and removes named storage areas
#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Names of all existing areas, sorted
    async fn list_areas(&self) -> StoreResult<Vec<String>>;

    /// Open an existing area
    async fn get_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>>;

    /// Create a new, empty area and open it
    async fn create_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>>;

    /// Remove an area and everything in it
    async fn delete_area(&self, name: &str) -> StoreResult<()>;

    async fn area_exists(&self, name: &str) -> StoreResult<bool>;
}

/// Area names are single, non-hidden path segments
fn validate_area_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidKey("area name must not be empty".to_string()));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." || name.starts_with('.') {
        return Err(StoreError::InvalidKey(format!("invalid area name: {name:?}")));
    }
    Ok(())
}

async fn ensure_root(root: &Path) -> StoreResult<()> {
    fs::create_dir_all(root)
        .await
        .map_err(|e| StoreError::io_at("create directory", root, e))
}

/// Areas are sub-directories of a root directory
pub struct FilesystemStorageManager {
    root: PathBuf,
}

impl FilesystemStorageManager {
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        ensure_root(&root).await?;
        Ok(Self { root })
    }

    fn area_path(&self, name: &str) -> StoreResult<PathBuf> {
        validate_area_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl StorageManager for FilesystemStorageManager {
    #[instrument(skip(self), fields(manager = "filesystem"))]
    async fn list_areas(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io_at("read directory", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io_at("read directory", &self.root, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io_at("stat", &entry.path(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() && validate_area_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(manager = "filesystem"))]
    async fn get_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>> {
        if !self.area_exists(name).await? {
            return Err(StoreError::NotFound(format!("storage area {name}")));
        }
        Ok(Arc::new(FilesystemObjectStore::new(self.area_path(name)?).await?))
    }

    #[instrument(skip(self), fields(manager = "filesystem"))]
    async fn create_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>> {
        let path = self.area_path(name)?;
        match fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(format!("storage area {name}")));
            }
            Err(e) => return Err(StoreError::io_at("create directory", &path, e)),
        }

        tracing::info!(area = name, "Created storage area");
        Ok(Arc::new(FilesystemObjectStore::new(path).await?))
    }

    #[instrument(skip(self), fields(manager = "filesystem"))]
    async fn delete_area(&self, name: &str) -> StoreResult<()> {
        if !self.area_exists(name).await? {
            return Err(StoreError::NotFound(format!("storage area {name}")));
        }
        let path = self.area_path(name)?;
        fs::remove_dir_all(&path)
            .await
            .map_err(|e| StoreError::io_at("remove", &path, e))?;

        tracing::info!(area = name, "Deleted storage area");
        Ok(())
    }

    async fn area_exists(&self, name: &str) -> StoreResult<bool> {
        let path = self.area_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io_at("stat", &path, e)),
        }
    }
}

/// Areas are `<root>/<name><ext>` archives of a single format
pub struct ArchiveStorageManager {
    root: PathBuf,
    format: ArchiveFormat,
}

impl ArchiveStorageManager {
    pub async fn new(root: impl AsRef<Path>, format: ArchiveFormat) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        ensure_root(&root).await?;
        Ok(Self { root, format })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    fn area_path(&self, name: &str) -> StoreResult<PathBuf> {
        validate_area_name(name)?;
        Ok(self.root.join(format!("{name}{}", self.format.extension())))
    }
}

#[async_trait]
impl StorageManager for ArchiveStorageManager {
    #[instrument(skip(self), fields(manager = "archive"))]
    async fn list_areas(&self) -> StoreResult<Vec<String>> {
        let extension = self.format.extension();
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io_at("read directory", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io_at("read directory", &self.root, e))?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_name(&file_name) {
                continue;
            }
            let Some(name) = file_name.strip_suffix(extension) else {
                continue;
            };
            let is_file = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io_at("stat", &entry.path(), e))?
                .is_file();
            if is_file && validate_area_name(name).is_ok() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(manager = "archive"))]
    async fn get_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>> {
        if !self.area_exists(name).await? {
            return Err(StoreError::NotFound(format!("storage area {name}")));
        }
        Ok(Arc::new(ArchiveObjectStore::new(self.area_path(name)?, self.format)?))
    }

    #[instrument(skip(self), fields(manager = "archive"))]
    async fn create_area(&self, name: &str) -> StoreResult<Arc<dyn ObjectStorage>> {
        let path = self.area_path(name)?;
        if self.area_exists(name).await? {
            return Err(StoreError::AlreadyExists(format!("storage area {name}")));
        }

        // Write a valid empty archive so the area shows up immediately
        let codec = self.format.codec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            codec.write_all(&target, &[], &CancellationToken::new())
        })
        .await??;

        tracing::info!(area = name, format = %self.format, "Created storage area");
        Ok(Arc::new(ArchiveObjectStore::new(path, self.format)?))
    }

    #[instrument(skip(self), fields(manager = "archive"))]
    async fn delete_area(&self, name: &str) -> StoreResult<()> {
        let path = self.area_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(area = name, "Deleted storage area");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("storage area {name}")))
            }
            Err(e) => Err(StoreError::io_at("remove", &path, e)),
        }
    }

    async fn area_exists(&self, name: &str) -> StoreResult<bool> {
        let path = self.area_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io_at("stat", &path, e)),
        }
    }
}
