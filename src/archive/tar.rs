use chrono::{DateTime, TimeZone, Utc};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::paths::{check_entry_size, persist, temp_file_beside};

use super::{ArchiveCodec, ArchiveEntry, ArchiveFormat, check_entries, open_existing, read_bounded};

/// Length of the name field in a USTAR header
const NAME_FIELD_LEN: usize = 100;

/// Name used by GNU tar for long-name extension records
const GNU_LONGLINK: &[u8] = b"././@LongLink";

/// Compression layer wrapped around the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
}

impl TarCompression {
    /// `.tar.gz`, `.tgz` and `.gz` are gzipped; `.tar.bz2`, `.tbz2` and
    /// `.bz2` are bzip2; anything else is plain tar
    pub fn from_path(path: &Path) -> Self {
        let name = path.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
            TarCompression::Gzip
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".bz2") {
            TarCompression::Bzip2
        } else {
            TarCompression::None
        }
    }
}

/// Header fields of a tar entry, read before its payload
struct EntryHeader {
    name: String,
    size: u64,
    is_dir: bool,
    mod_time: Option<DateTime<Utc>>,
}

/// Reads and rewrites TAR, TAR+GZIP and TAR+BZIP2 archives
pub struct TarCodec {
    compression: TarCompression,
}

impl TarCodec {
    pub fn new(compression: TarCompression) -> Self {
        TarCodec { compression }
    }

    /// Pick the compression from the archive's file name
    pub fn for_path(path: &Path) -> Self {
        Self::new(TarCompression::from_path(path))
    }

    pub fn compression(&self) -> TarCompression {
        self.compression
    }

    fn decoder(&self, file: File) -> Box<dyn Read + Send> {
        let reader = BufReader::new(file);
        match self.compression {
            TarCompression::None => Box::new(reader),
            TarCompression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            TarCompression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        }
    }

    /// Walk the archive headers in order, handing each file or directory
    /// entry to `visit` together with a reader over its payload.
    ///
    /// Every regular entry's declared size is checked against the cap before
    /// `visit` sees it. Links, devices and other special entries are skipped.
    fn scan<F>(&self, path: &Path, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(EntryHeader, &mut dyn Read) -> StoreResult<ControlFlow<()>>,
    {
        let Some(file) = open_existing(path)? else {
            return Ok(());
        };

        let mut archive = tar::Archive::new(self.decoder(file));
        let entries = archive
            .entries()
            .map_err(|e| StoreError::bad_format(path, e))?;

        for entry_result in entries {
            let mut entry = entry_result.map_err(|e| StoreError::bad_format(path, e))?;

            let entry_type = entry.header().entry_type();
            let mut name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let is_dir = entry_type.is_dir();
            if is_dir && !name.ends_with('/') {
                name.push('/');
            }

            if !is_dir && !entry_type.is_file() && entry_type != tar::EntryType::Continuous {
                tracing::trace!(entry = %name, ?entry_type, "skipping special tar entry");
                continue;
            }

            let size = if is_dir { 0 } else { entry.size() };
            if !is_dir {
                check_entry_size(&name, size)?;
            }

            let mod_time = entry
                .header()
                .mtime()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());

            let header = EntryHeader {
                name,
                size,
                is_dir,
                mod_time,
            };

            if visit(header, &mut entry)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    /// Write all entries through a tar builder and hand back the inner writer
    fn write_entries<W: Write>(
        &self,
        writer: W,
        path: &Path,
        entries: &[ArchiveEntry],
        abort: &CancellationToken,
    ) -> StoreResult<W> {
        let mut builder = tar::Builder::new(writer);

        for entry in entries {
            if abort.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let mut header = tar::Header::new_ustar();
            let content = entry.bytes();
            if entry.is_dir {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
            }
            let mtime = entry.mod_time.map(|t| t.timestamp().max(0) as u64).unwrap_or(0);
            header.set_mtime(mtime);

            let data: &[u8] = if entry.is_dir { &[] } else { &content };
            append_named(&mut builder, &mut header, &entry.name, data)
                .map_err(|e| StoreError::io_at("write tar entry to", path, e))?;
        }

        // Writes the two zero blocks that terminate the archive
        builder
            .into_inner()
            .map_err(|e| StoreError::io_at("finish tar stream for", path, e))
    }
}

/// Append an entry whose name is stored byte-for-byte.
///
/// `tar::Builder::append_data` normalizes paths (drops `.` components,
/// collapses `//`, rejects absolute names), which would break exact key
/// matching, so the name field is filled in directly. Names longer than the
/// USTAR field are preceded by a GNU long-name record.
fn append_named<W: Write>(
    builder: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let bytes = name.as_bytes();

    if bytes.len() > NAME_FIELD_LEN {
        let mut long = tar::Header::new_gnu();
        long.as_old_mut().name[..GNU_LONGLINK.len()].copy_from_slice(GNU_LONGLINK);
        long.set_entry_type(tar::EntryType::GNULongName);
        long.set_mode(0o644);
        long.set_mtime(0);
        // Name plus trailing NUL
        long.set_size(bytes.len() as u64 + 1);
        long.set_cksum();

        let mut payload = Vec::with_capacity(bytes.len() + 1);
        payload.extend_from_slice(bytes);
        payload.push(0);
        builder.append(&long, payload.as_slice())?;
    }

    let field = &mut header.as_old_mut().name;
    field.fill(0);
    let len = bytes.len().min(NAME_FIELD_LEN);
    field[..len].copy_from_slice(&bytes[..len]);
    header.set_cksum();

    builder.append(header, data)
}

impl ArchiveCodec for TarCodec {
    fn format(&self) -> ArchiveFormat {
        match self.compression {
            TarCompression::None => ArchiveFormat::Tar,
            TarCompression::Gzip => ArchiveFormat::TarGz,
            TarCompression::Bzip2 => ArchiveFormat::TarBz2,
        }
    }

    fn read_all(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        self.scan(path, |header, reader| {
            let content = if header.is_dir {
                None
            } else {
                Some(read_bounded(reader, path, &header.name, header.size)?)
            };
            // Authoritative size is what was actually read
            let size = content.as_ref().map(|c| c.len() as u64).unwrap_or(0);
            entries.push(ArchiveEntry {
                name: header.name,
                size,
                is_dir: header.is_dir,
                mod_time: header.mod_time,
                content,
            });
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(entries)
    }

    fn read_index(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        // Unread payloads are skipped by the tar reader
        self.scan(path, |header, _| {
            entries.push(ArchiveEntry::header(
                header.name,
                header.size,
                header.is_dir,
                header.mod_time,
            ));
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(entries)
    }

    fn read_entry(&self, path: &Path, name: &str) -> StoreResult<Option<ArchiveEntry>> {
        let mut found = None;
        self.scan(path, |header, reader| {
            if header.name != name {
                return Ok(ControlFlow::Continue(()));
            }
            let content = if header.is_dir {
                None
            } else {
                Some(read_bounded(reader, path, &header.name, header.size)?)
            };
            let size = content.as_ref().map(|c| c.len() as u64).unwrap_or(0);
            found = Some(ArchiveEntry {
                name: header.name,
                size,
                is_dir: header.is_dir,
                mod_time: header.mod_time,
                content,
            });
            // Keep scanning: a later duplicate replaces this one
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    fn write_all(
        &self,
        path: &Path,
        entries: &[ArchiveEntry],
        abort: &CancellationToken,
    ) -> StoreResult<()> {
        check_entries(entries)?;

        // Dropping `temp` on any early return removes it
        let mut temp = temp_file_beside(path)?;
        {
            let file = temp.as_file_mut();
            match self.compression {
                TarCompression::None => {
                    let file = self.write_entries(file, path, entries, abort)?;
                    file.flush()
                        .map_err(|e| StoreError::io_at("flush", path, e))?;
                }
                TarCompression::Gzip => {
                    let encoder =
                        flate2::write::GzEncoder::new(file, flate2::Compression::default());
                    let encoder = self.write_entries(encoder, path, entries, abort)?;
                    encoder
                        .finish()
                        .map_err(|e| StoreError::io_at("finish gzip stream for", path, e))?;
                }
                TarCompression::Bzip2 => {
                    let encoder =
                        bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
                    let encoder = self.write_entries(encoder, path, entries, abort)?;
                    encoder
                        .finish()
                        .map_err(|e| StoreError::io_at("finish bzip2 stream for", path, e))?;
                }
            }
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io_at("sync temp file for", path, e))?;

        if abort.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        persist(temp, path)?;

        tracing::debug!(
            archive = %path.display(),
            format = %self.format(),
            entries = entries.len(),
            "Rewrote tar archive"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::file("test.txt", Bytes::from_static(b"Hello, World!")),
            ArchiveEntry::directory("folder/"),
            ArchiveEntry::file("folder/nested.txt", Bytes::from_static(b"Nested")),
        ]
    }

    #[test]
    fn test_compression_from_path() {
        assert_eq!(TarCompression::from_path(Path::new("a.tar")), TarCompression::None);
        assert_eq!(TarCompression::from_path(Path::new("a.tar.gz")), TarCompression::Gzip);
        assert_eq!(TarCompression::from_path(Path::new("a.tgz")), TarCompression::Gzip);
        assert_eq!(TarCompression::from_path(Path::new("a.gz")), TarCompression::Gzip);
        assert_eq!(TarCompression::from_path(Path::new("a.tbz2")), TarCompression::Bzip2);
    }

    #[test]
    fn test_read_all_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let codec = TarCodec::new(TarCompression::Gzip);
        let entries = codec.read_all(&dir.path().join("nope.tar.gz")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_write_then_read_each_compression() {
        let dir = tempfile::tempdir().unwrap();
        for (file, compression) in [
            ("plain.tar", TarCompression::None),
            ("gz.tar.gz", TarCompression::Gzip),
            ("bz.tar.bz2", TarCompression::Bzip2),
        ] {
            let path = dir.path().join(file);
            let codec = TarCodec::new(compression);
            codec
                .write_all(&path, &sample_entries(), &CancellationToken::new())
                .unwrap();

            let entries = codec.read_all(&path).unwrap();
            assert_eq!(entries.len(), 3, "{file}");
            assert_eq!(entries[0].name, "test.txt");
            assert_eq!(entries[0].content.as_deref(), Some(&b"Hello, World!"[..]));
            assert_eq!(entries[0].size, 13);
            assert!(entries[1].is_dir);
            assert_eq!(entries[1].name, "folder/");
            assert!(entries[1].content.is_none());
        }
    }

    #[test]
    fn test_headers_use_ustar_types_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.tar");
        TarCodec::new(TarCompression::None)
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let mut archive = tar::Archive::new(File::open(&path).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            seen.push((header.entry_type(), header.mode().unwrap()));
        }
        assert_eq!(seen[0], (tar::EntryType::Regular, 0o644));
        assert_eq!(seen[1], (tar::EntryType::Directory, 0o755));
    }

    #[test]
    fn test_names_are_stored_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.tar");
        let long_name = format!("deep/{}/file.txt", "x".repeat(150));
        let entries = vec![
            ArchiveEntry::file("./dot.txt", Bytes::from_static(b"1")),
            ArchiveEntry::file("a//b", Bytes::from_static(b"2")),
            ArchiveEntry::file(long_name.clone(), Bytes::from_static(b"3")),
        ];

        let codec = TarCodec::new(TarCompression::None);
        codec.write_all(&path, &entries, &CancellationToken::new()).unwrap();

        let names: Vec<_> = codec
            .read_index(&path)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["./dot.txt".to_string(), "a//b".to_string(), long_name]);
    }

    #[test]
    fn test_read_entry_finds_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.tar.gz");
        let codec = TarCodec::new(TarCompression::Gzip);
        codec
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let entry = codec.read_entry(&path, "folder/nested.txt").unwrap().unwrap();
        assert_eq!(entry.content.unwrap(), Bytes::from_static(b"Nested"));
        assert!(codec.read_entry(&path, "folder/nested").unwrap().is_none());
        assert!(codec.read_entry(&path, "folder").unwrap().is_none());
    }

    #[test]
    fn test_declared_size_over_cap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bomb.tar");

        // Header claims 200 MiB, no payload follows
        let mut header = tar::Header::new_ustar();
        header.set_path("bomb.bin").unwrap();
        header.set_size(200 * 1024 * 1024);
        header.set_mode(0o644);
        header.set_cksum();
        let mut data = header.as_bytes().to_vec();
        data.extend_from_slice(&[0u8; 1024]);
        std::fs::write(&path, data).unwrap();

        let codec = TarCodec::new(TarCompression::None);
        assert!(matches!(codec.read_index(&path), Err(StoreError::TooLarge { .. })));
        assert!(matches!(codec.read_all(&path), Err(StoreError::TooLarge { .. })));
    }

    #[test]
    fn test_corrupt_gzip_is_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.tar.gz");
        std::fs::write(&path, b"definitely not gzip data").unwrap();

        let codec = TarCodec::new(TarCompression::Gzip);
        assert!(matches!(codec.read_all(&path), Err(StoreError::BadFormat { .. })));
    }

    #[test]
    fn test_cancelled_write_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.tar");
        std::fs::write(&path, b"previous").unwrap();

        let abort = CancellationToken::new();
        abort.cancel();
        let result = TarCodec::new(TarCompression::None).write_all(&path, &sample_entries(), &abort);

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(std::fs::read(&path).unwrap(), b"previous");
        // No temp file left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
