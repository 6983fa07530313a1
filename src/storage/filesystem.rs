//! Local filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::instrument;

use crate::error::{StoreError, StoreResult};
use crate::paths::{
    check_entry_size, is_directory_key, is_temp_name, persist, temp_file_beside, validate_key,
};

use super::{Listing, ListingBuilder, ObjectReader, ObjectStorage, Tags, bytes_reader};

/// Object store mapping each key to a file under a root directory.
///
/// Directory keys (`a/`) map to directories. Writes go through a temp file in
/// the target directory that is synced and renamed into place.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    /// Create a new filesystem store, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io_at("create directory", &root, e))?;
        let root = fs::canonicalize(&root)
            .await
            .map_err(|e| StoreError::io_at("canonicalize", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the full path for a key, with path traversal protection.
    async fn key_path(&self, key: &str) -> StoreResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key)).await?
    }

    /// Reject keys that would resolve outside the root, including through a
    /// symlinked ancestor.
    fn key_path_sync(root: &Path, key: &str) -> StoreResult<PathBuf> {
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey(format!(
                "absolute keys are not allowed: {key}"
            )));
        }

        // `components()` folds `a//b` and `a/./b` into `a/b`; keys are byte-exact
        let segments = key.strip_suffix('/').unwrap_or(key);
        if segments
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StoreError::InvalidKey(format!(
                "empty or relative path segment: {key}"
            )));
        }

        for component in Path::new(key).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(StoreError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);

        // Nearest existing ancestor (or the path itself) must stay inside root
        let mut ancestor = Some(path.as_path());
        while let Some(candidate) = ancestor {
            match std::fs::symlink_metadata(candidate) {
                Ok(_) => {
                    let canonical = candidate.canonicalize().map_err(|_| {
                        StoreError::InvalidKey(format!("unresolvable path for key: {key}"))
                    })?;
                    if !canonical.starts_with(root) {
                        return Err(StoreError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    ancestor = candidate.parent();
                }
                Err(e) => return Err(StoreError::io_at("stat", candidate, e)),
            }
        }

        Ok(path)
    }

    async fn metadata(path: &Path) -> StoreResult<Option<std::fs::Metadata>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io_at("stat", path, e)),
        }
    }

    async fn is_present(&self, key: &str) -> StoreResult<bool> {
        let path = self.key_path(key).await?;
        Ok(match Self::metadata(&path).await? {
            Some(meta) if is_directory_key(key) => meta.is_dir(),
            Some(meta) => meta.is_file(),
            None => false,
        })
    }
}

fn modified(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl ObjectStorage for FilesystemObjectStore {
    #[instrument(skip(self, data, _tags), fields(backend = "filesystem", size = data.len()))]
    async fn upload(&self, key: &str, data: Bytes, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        let path = self.key_path(key).await?;

        if is_directory_key(key) {
            return fs::create_dir_all(&path)
                .await
                .map_err(|e| StoreError::io_at("create directory", &path, e));
        }

        check_entry_size(key, data.len() as u64)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io_at("create directory", parent, e))?;
        }

        // Write to a temp file beside the target, fsync, then rename
        tokio::task::spawn_blocking(move || {
            let mut temp = temp_file_beside(&path)?;
            temp.write_all(&data)
                .map_err(|e| StoreError::io_at("write temp file for", &path, e))?;
            temp.as_file()
                .sync_all()
                .map_err(|e| StoreError::io_at("sync temp file for", &path, e))?;
            persist(temp, &path)
        })
        .await?
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn download(&self, key: &str) -> StoreResult<ObjectReader> {
        validate_key(key)?;
        let path = self.key_path(key).await?;

        let meta = Self::metadata(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if is_directory_key(key) {
            if meta.is_dir() {
                return Ok(bytes_reader(Bytes::new()));
            }
            return Err(StoreError::NotFound(key.to_string()));
        }
        if !meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::io_at("open", &path, e)
            }
        })?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        self.is_present(key).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        if !self.is_present(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let path = self.key_path(key).await?;
        let result = if is_directory_key(key) {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        };

        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::io_at("remove", &path, e)
            }
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StoreResult<Listing> {
        // Only the directory holding the prefix's last segment is read
        let dir_key = match prefix.rfind('/') {
            Some(pos) => &prefix[..=pos],
            None => "",
        };
        let dir = if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_key).await?
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(Listing::empty());
            }
            Err(e) => return Err(StoreError::io_at("read directory", &dir, e)),
        };

        let mut builder = ListingBuilder::new(prefix);
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io_at("read directory", &dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_temp_name(&name) {
                continue;
            }

            // file_type() does not follow symlinks; those are skipped
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::io_at("stat", &entry.path(), e))?;

            if file_type.is_dir() {
                builder.add(&format!("{dir_key}{name}/"), 0, true, None);
            } else if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| StoreError::io_at("stat", &entry.path(), e))?;
                builder.add(&format!("{dir_key}{name}"), meta.len(), false, modified(&meta));
            }
        }

        Ok(builder.build())
    }

    #[instrument(skip(self, _tags), fields(backend = "filesystem"))]
    async fn update_metadata(&self, key: &str, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        if !self.is_present(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        for key in ["../escape", "a/../../b", "/etc/passwd", "./a"] {
            assert!(
                matches!(
                    FilesystemObjectStore::key_path_sync(&root, key),
                    Err(StoreError::InvalidKey(_))
                ),
                "{key}"
            );
        }
        assert!(FilesystemObjectStore::key_path_sync(&root, "a/b/c.txt").is_ok());
    }

    #[test]
    fn test_key_path_rejects_non_canonical_segments() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        for key in ["a//b", "a/./b", "a/.", "a//", "a/b/./"] {
            assert!(
                matches!(
                    FilesystemObjectStore::key_path_sync(&root, key),
                    Err(StoreError::InvalidKey(_))
                ),
                "{key}"
            );
        }
        assert!(FilesystemObjectStore::key_path_sync(&root, "a/b/").is_ok());
        assert!(FilesystemObjectStore::key_path_sync(&root, ".hidden/x").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_path_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let result = FilesystemObjectStore::key_path_sync(&root, "link/new/file.txt");
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_file_and_directory_keys_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path()).await.unwrap();

        store.upload("a/", Bytes::new(), Tags::new()).await.unwrap();
        assert!(store.exists("a/").await.unwrap());
        assert!(!store.exists("a").await.unwrap());

        store.upload("b", Bytes::from_static(b"x"), Tags::new()).await.unwrap();
        assert!(store.exists("b").await.unwrap());
        assert!(!store.exists("b/").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path()).await.unwrap();
        store.upload("kept.txt", Bytes::from_static(b"x"), Tags::new()).await.unwrap();
        std::fs::write(dir.path().join(".arcstore-leftover.tmp"), b"junk").unwrap();

        let (objects, prefixes) = store.list("").await.unwrap().collect().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "kept.txt");
        assert!(objects[0].last_modified.is_some());
        assert!(prefixes.is_empty());
    }
}
