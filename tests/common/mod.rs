//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use arcstore::{Listing, StoredObject, StoredPrefix};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::Path;

/// Build an uncompressed tarball in memory. Names ending in `/` become
/// directories.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
        }
        header.set_mtime(1_700_000_000);
        builder
            .append_data(&mut header, name, *content)
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    gzip(&tar_bytes(entries))
}

/// Build a ZIP archive in memory
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("zip dir");
        } else {
            writer.start_file(*name, options).expect("zip file");
            writer.write_all(content).expect("zip write");
        }
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Files in `dir` other than the ones named
pub fn stray_files(dir: &Path, expected: &[&str]) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
        .filter(|name| !expected.contains(&name.as_str()))
        .collect()
}

pub async fn collect(listing: Listing) -> (Vec<String>, Vec<String>) {
    let (objects, prefixes): (Vec<StoredObject>, Vec<StoredPrefix>) =
        listing.collect().await.expect("listing");
    (
        objects.into_iter().map(|o| o.key).collect(),
        prefixes.into_iter().map(|p| p.key).collect(),
    )
}
