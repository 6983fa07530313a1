use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::fs::File;
use std::io::{BufReader, Seek, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{StoreError, StoreResult};
use crate::paths::{check_entry_size, persist, temp_file_beside};

use super::{
    ArchiveCodec, ArchiveEntry, ArchiveFormat, check_entries, open_existing, read_bounded,
    read_error,
};

/// Reads and rewrites ZIP archives.
///
/// Entries are written DEFLATE-compressed with unix modes 0644 for files and
/// 0755 for directories.
pub struct ZipCodec;

impl Default for ZipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipCodec {
    pub fn new() -> Self {
        ZipCodec
    }

    fn open(path: &Path) -> StoreResult<Option<ZipArchive<BufReader<File>>>> {
        let Some(file) = open_existing(path)? else {
            return Ok(None);
        };
        ZipArchive::new(BufReader::new(file))
            .map(Some)
            .map_err(|e| zip_error(path, e))
    }

    fn write_entries<W: Write + Seek>(
        writer: W,
        path: &Path,
        entries: &[ArchiveEntry],
        abort: &CancellationToken,
    ) -> StoreResult<W> {
        let mut zip = ZipWriter::new(writer);
        let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in entries {
            if abort.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let options = base.last_modified_time(to_zip_time(entry.mod_time));
            if entry.is_dir {
                zip.add_directory(entry.name.as_str(), options.unix_permissions(0o755))
                    .map_err(|e| zip_error(path, e))?;
            } else {
                zip.start_file(entry.name.as_str(), options.unix_permissions(0o644))
                    .map_err(|e| zip_error(path, e))?;
                zip.write_all(&entry.bytes())
                    .map_err(|e| StoreError::io_at("write zip entry to", path, e))?;
            }
        }

        zip.finish().map_err(|e| zip_error(path, e))
    }
}

/// Translate zip crate errors; framing and compression failures are format errors
fn zip_error(path: &Path, err: ZipError) -> StoreError {
    match err {
        ZipError::Io(e) => read_error(path, e),
        other => StoreError::bad_format(path, other),
    }
}

/// Only a trailing `/` marks a directory; `ZipFile::is_dir` also accepts `\`
fn is_directory_name(name: &str) -> bool {
    name.ends_with('/')
}

fn from_zip_time(time: Option<zip::DateTime>) -> Option<DateTime<Utc>> {
    let time = time?;
    NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?
        .and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)
        .map(|naive| naive.and_utc())
}

/// MS-DOS timestamps only cover 1980..=2107; anything outside gets the epoch
fn to_zip_time(time: Option<DateTime<Utc>>) -> zip::DateTime {
    time.and_then(|t| {
        zip::DateTime::from_date_and_time(
            u16::try_from(t.year()).ok()?,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
        )
        .ok()
    })
    .unwrap_or_default()
}

impl ArchiveCodec for ZipCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn read_all(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>> {
        let Some(mut archive) = Self::open(path)? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(|e| zip_error(path, e))?;
            let name = file.name().to_string();
            let is_dir = is_directory_name(&name);
            let mod_time = from_zip_time(file.last_modified());

            if is_dir {
                entries.push(ArchiveEntry::header(name, 0, true, mod_time));
                continue;
            }

            check_entry_size(&name, file.size())?;
            let declared = file.size();
            let content = read_bounded(file, path, &name, declared)?;
            entries.push(ArchiveEntry {
                name,
                size: content.len() as u64,
                is_dir: false,
                mod_time,
                content: Some(content),
            });
        }

        Ok(entries)
    }

    fn read_index(&self, path: &Path) -> StoreResult<Vec<ArchiveEntry>> {
        let Some(mut archive) = Self::open(path)? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            // Raw access reads the central directory record without inflating
            let file = archive.by_index_raw(i).map_err(|e| zip_error(path, e))?;
            let is_dir = is_directory_name(file.name());
            let size = if is_dir { 0 } else { file.size() };
            if !is_dir {
                check_entry_size(file.name(), size)?;
            }
            entries.push(ArchiveEntry::header(
                file.name().to_string(),
                size,
                is_dir,
                from_zip_time(file.last_modified()),
            ));
        }

        Ok(entries)
    }

    fn read_entry(&self, path: &Path, name: &str) -> StoreResult<Option<ArchiveEntry>> {
        let Some(mut archive) = Self::open(path)? else {
            return Ok(None);
        };

        let file = match archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(zip_error(path, e)),
        };

        let is_dir = is_directory_name(name);
        let mod_time = from_zip_time(file.last_modified());
        if is_dir {
            return Ok(Some(ArchiveEntry::header(name.to_string(), 0, true, mod_time)));
        }

        check_entry_size(name, file.size())?;
        let declared = file.size();
        let content = read_bounded(file, path, name, declared)?;
        Ok(Some(ArchiveEntry {
            name: name.to_string(),
            size: content.len() as u64,
            is_dir: false,
            mod_time,
            content: Some(content),
        }))
    }

    fn write_all(
        &self,
        path: &Path,
        entries: &[ArchiveEntry],
        abort: &CancellationToken,
    ) -> StoreResult<()> {
        check_entries(entries)?;

        let mut temp = temp_file_beside(path)?;
        let file = Self::write_entries(temp.as_file_mut(), path, entries, abort)?;
        file.flush()
            .map_err(|e| StoreError::io_at("flush", path, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io_at("sync temp file for", path, e))?;

        if abort.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        persist(temp, path)?;

        tracing::debug!(
            archive = %path.display(),
            entries = entries.len(),
            "Rewrote zip archive"
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
    fn test_write_then_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.zip");
        let codec = ZipCodec::new();
        codec
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let entries = codec.read_all(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "test.txt");
        assert_eq!(entries[0].content.as_deref(), Some(&b"Hello, World!"[..]));
        assert!(entries[1].is_dir);
        assert_eq!(entries[1].name, "folder/");
        assert_eq!(entries[2].size, 6);
    }

    #[test]
    fn test_entries_are_deflated_with_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.zip");
        ZipCodec::new()
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let file = archive.by_name("test.txt").unwrap();
        assert_eq!(file.compression(), CompressionMethod::Deflated);
        assert_eq!(file.unix_mode().unwrap() & 0o777, 0o644);
        drop(file);

        let dir_entry = archive.by_name("folder/").unwrap();
        assert!(dir_entry.is_dir());
        assert_eq!(dir_entry.unix_mode().unwrap() & 0o777, 0o755);
    }

    #[test]
    fn test_read_index_has_sizes_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.zip");
        let codec = ZipCodec::new();
        codec
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let index = codec.read_index(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index[0].size, 13);
        assert!(index.iter().all(|e| e.content.is_none()));
        assert!(index[0].mod_time.is_some());
    }

    #[test]
    fn test_read_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.zip");
        let codec = ZipCodec::new();
        codec
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();

        let entry = codec.read_entry(&path, "folder/nested.txt").unwrap().unwrap();
        assert_eq!(entry.content.unwrap(), Bytes::from_static(b"Nested"));
        assert!(codec.read_entry(&path, "missing.txt").unwrap().is_none());
    }

    #[test]
    fn test_backslash_name_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("win.zip");
        let codec = ZipCodec::new();
        let entries = vec![ArchiveEntry::file("win\\", Bytes::from_static(b"payload"))];
        codec
            .write_all(&path, &entries, &CancellationToken::new())
            .unwrap();

        let index = codec.read_index(&path).unwrap();
        assert_eq!(index.len(), 1);
        assert!(!index[0].is_dir);
        assert_eq!(index[0].size, 7);

        let entry = codec.read_entry(&path, "win\\").unwrap().unwrap();
        assert_eq!(entry.content.unwrap(), Bytes::from_static(b"payload"));

        // Rewriting what was read back must still pass the entry checks
        let all = codec.read_all(&path).unwrap();
        codec.write_all(&path, &all, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_missing_archive_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.zip");
        assert!(ZipCodec::new().read_all(&path).unwrap().is_empty());
        assert!(ZipCodec::new().read_entry(&path, "x").unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.zip");
        std::fs::write(&path, b"this is not a zip archive at all").unwrap();

        let result = ZipCodec::new().read_all(&path);
        assert!(matches!(result, Err(StoreError::BadFormat { .. })));
    }

    #[test]
    fn test_zip_time_conversion() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
            .and_utc();
        let zip_time = to_zip_time(Some(time));
        assert_eq!(from_zip_time(Some(zip_time)), Some(time));

        // Before the MS-DOS epoch
        let ancient = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        assert_eq!(to_zip_time(Some(ancient)).year(), 1980);
    }

    #[test]
    fn test_cancelled_write_keeps_old_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.zip");
        let codec = ZipCodec::new();
        codec
            .write_all(&path, &sample_entries(), &CancellationToken::new())
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        let abort = CancellationToken::new();
        abort.cancel();
        let result = codec.write_all(&path, &[], &abort);

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
