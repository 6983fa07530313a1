//! Key validation, listing placement and same-directory temp files.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{StoreError, StoreResult};

/// Maximum content length of a single entry (100 MiB).
///
/// Enforced when reading an entry out of an archive and when writing one in,
/// so a hostile archive cannot make us inflate unbounded data.
pub const MAX_ENTRY_SIZE: u64 = 100 * 1024 * 1024;

/// Name prefix for temp files created next to a target file.
pub const TEMP_PREFIX: &str = ".arcstore-";

/// Reject keys no store can address.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key.contains('\0') {
        return Err(StoreError::InvalidKey(format!(
            "key contains a NUL byte: {key:?}"
        )));
    }
    Ok(())
}

/// Keys with a trailing slash are directory markers.
pub fn is_directory_key(key: &str) -> bool {
    key.ends_with('/')
}

/// Fail with `TooLarge` if `size` is over the entry cap.
pub fn check_entry_size(name: &str, size: u64) -> StoreResult<()> {
    if size > MAX_ENTRY_SIZE {
        return Err(StoreError::too_large(name, size, MAX_ENTRY_SIZE));
    }
    Ok(())
}

/// Where a key lands when listing under a prefix with `/` as delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement<'a> {
    /// Key is an object directly under the prefix.
    Object,
    /// Key lives below an immediate sub-directory; carries the common prefix
    /// (always ending in `/`).
    Prefix(&'a str),
    /// Key does not start with the prefix, or is the directory marker named
    /// by the prefix itself.
    Outside,
}

/// Classify `key` relative to `prefix`.
///
/// The prefix is matched byte-for-byte; it does not need to end in `/`
/// (`fold` matches `folder/x` and yields the common prefix `folder/`).
pub fn place<'a>(prefix: &str, key: &'a str, is_dir: bool) -> Placement<'a> {
    let Some(rest) = key.strip_prefix(prefix) else {
        return Placement::Outside;
    };

    if rest.is_empty() {
        // The prefix names this entry exactly. Directory markers are never
        // reported as objects.
        return if is_dir {
            Placement::Outside
        } else {
            Placement::Object
        };
    }

    match rest.find('/') {
        Some(pos) => Placement::Prefix(&key[..prefix.len() + pos + 1]),
        None if is_dir => Placement::Outside,
        None => Placement::Object,
    }
}

/// Resolve `path` against the current directory without touching the disk.
pub fn absolute(path: &Path) -> StoreResult<PathBuf> {
    std::path::absolute(path).map_err(|e| StoreError::io_at("resolve", path, e))
}

/// Extension family of a file name, including compound `.tar.*` suffixes.
pub fn extension_family(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    for compound in [".tar.gz", ".tar.bz2"] {
        if name.ends_with(compound) {
            return compound.to_string();
        }
    }

    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
        None => String::new(),
    }
}

/// Create a temp file in the same directory as `target`, with the same
/// extension family, so the final rename stays on one filesystem.
pub fn temp_file_beside(target: &Path) -> StoreResult<NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(&extension_family(target))
        .tempfile_in(dir)
        .map_err(|e| StoreError::io_at("create temp file in", dir, e))
}

/// Atomically move a finished temp file over `target`.
///
/// On failure the temp file is dropped, which removes it.
pub fn persist(temp: NamedTempFile, target: &Path) -> StoreResult<()> {
    temp.persist(target)
        .map(|_| ())
        .map_err(|e| StoreError::io_at("rename temp file over", target, e.error))
}

/// Whether a directory entry name is one of our in-flight temp files.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a").is_ok());
        assert!(validate_key("a/").is_ok());
        assert!(matches!(validate_key(""), Err(StoreError::InvalidKey(_))));
        assert!(matches!(validate_key("a\0b"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_is_directory_key() {
        assert!(is_directory_key("foo/"));
        assert!(!is_directory_key("foo"));
    }

    #[test]
    fn test_check_entry_size() {
        assert!(check_entry_size("x", MAX_ENTRY_SIZE).is_ok());
        assert!(matches!(
            check_entry_size("x", MAX_ENTRY_SIZE + 1),
            Err(StoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_place_direct_child() {
        assert_eq!(place("a/", "a/b", false), Placement::Object);
        assert_eq!(place("", "test.txt", false), Placement::Object);
    }

    #[test]
    fn test_place_nested_child() {
        assert_eq!(place("a/", "a/c/d", false), Placement::Prefix("a/c/"));
        assert_eq!(place("", "folder/nested.txt", false), Placement::Prefix("folder/"));
    }

    #[test]
    fn test_place_directory_marker() {
        // Marker for a sub-directory becomes a prefix
        assert_eq!(place("", "folder/", true), Placement::Prefix("folder/"));
        // Marker named by the prefix itself is not reported
        assert_eq!(place("folder/", "folder/", true), Placement::Outside);
    }

    #[test]
    fn test_place_prefix_collision() {
        assert_eq!(place("folder/", "folder-extra/file.txt", false), Placement::Outside);
        assert_eq!(place("folder", "folder-extra/file.txt", false), Placement::Prefix("folder-extra/"));
    }

    #[test]
    fn test_place_exact_object_match() {
        assert_eq!(place("test.txt", "test.txt", false), Placement::Object);
        assert_eq!(place("other", "test.txt", false), Placement::Outside);
    }

    #[test]
    fn test_extension_family() {
        assert_eq!(extension_family(Path::new("/tmp/x.tar.gz")), ".tar.gz");
        assert_eq!(extension_family(Path::new("/tmp/X.TAR.BZ2")), ".tar.bz2");
        assert_eq!(extension_family(Path::new("/tmp/x.tgz")), ".tgz");
        assert_eq!(extension_family(Path::new("/tmp/x.zip")), ".zip");
        assert_eq!(extension_family(Path::new("/tmp/archive")), "");
    }

    #[test]
    fn test_temp_file_beside_same_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("store.tar.gz");
        let temp = temp_file_beside(&target).unwrap();

        assert_eq!(temp.path().parent(), Some(dir.path()));
        let name = temp.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(is_temp_name(&name));
        assert!(name.ends_with(".tar.gz"));
    }

    #[test]
    fn test_persist_replaces_target() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.zip");
        std::fs::write(&target, b"old").unwrap();

        let mut temp = temp_file_beside(&target).unwrap();
        temp.write_all(b"new").unwrap();
        persist(temp, &target).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
