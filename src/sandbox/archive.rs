//! Tar archive codec used for every file transfer across the sandbox boundary.
//!
//! The runtime only exchanges whole-path archives: a put extracts an archive
//! into a directory, a get returns an archive whose single root is the
//! requested path.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{BoxenvError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const FILE_MODE: u32 = 0o644;

/// Default chunk size when streaming an archive to a consumer.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One filesystem entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub relative_path: String,
    pub content: Vec<u8>,
    pub is_directory: bool,
}

/// Metadata of the root entry of a fetched archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<DateTime<Utc>>,
    pub link_target: Option<String>,
}

/// Raw archive bytes as returned by the runtime.
#[derive(Debug, Clone, Default)]
pub struct ArchiveStream {
    bytes: Vec<u8>,
}

impl ArchiveStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.chunks(CHUNK_SIZE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        decode(&self.bytes)
    }

    pub fn stat(&self) -> Result<ArchiveStat> {
        root_stat(&self.bytes)
    }

    pub fn unpack_into(&self, dir: &Path) -> Result<()> {
        unpack_into(&self.bytes, dir)
    }

    /// Write the raw archive to `path`.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, &self.bytes).await?;
        debug!(path = %path.display(), size = self.bytes.len(), "Saved archive");
        Ok(())
    }
}

/// Encode a single file into a one-entry archive.
pub fn encode_file(name: &str, content: &[u8]) -> Result<Vec<u8>> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(FILE_MODE);
    header.set_mtime(mtime);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| BoxenvError::Archive(format!("Failed to encode '{}': {}", name, e)))?;

    builder
        .into_inner()
        .map_err(|e| BoxenvError::Archive(format!("Failed to finish archive: {}", e)))
}

/// Decode an archive into its entries, in archive order.
pub fn decode(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut entries = Vec::new();

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let is_directory = entry.header().entry_type().is_dir();
        let relative_path = normalize_entry_path(&entry.path().map_err(archive_error)?);

        let mut content = Vec::new();
        if !is_directory {
            entry.read_to_end(&mut content).map_err(archive_error)?;
        }

        entries.push(ArchiveEntry {
            relative_path,
            content,
            is_directory,
        });
    }

    Ok(entries)
}

/// Metadata of the first (root) entry of an archive.
pub fn root_stat(bytes: &[u8]) -> Result<ArchiveStat> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut entries = archive.entries().map_err(archive_error)?;
    let entry = entries
        .next()
        .ok_or_else(|| BoxenvError::Archive("Archive is empty".to_string()))?
        .map_err(archive_error)?;

    let path = normalize_entry_path(&entry.path().map_err(archive_error)?);
    let header = entry.header();
    let name = path.rsplit('/').next().unwrap_or(&path).to_string();
    let mtime = header
        .mtime()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
    let link_target = entry
        .link_name()
        .map_err(archive_error)?
        .map(|p| p.display().to_string());

    Ok(ArchiveStat {
        name,
        size: header.size().map_err(archive_error)?,
        mode: header.mode().map_err(archive_error)?,
        mtime,
        link_target,
    })
}

/// Pack a local file or directory into an archive with a single root named after it.
pub fn pack_path(path: &Path) -> Result<Vec<u8>> {
    let root = path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| BoxenvError::Archive(format!("Cannot archive '{}'", path.display())))?;

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if path.is_dir() {
        builder.append_dir_all(&root, path)?;
    } else {
        builder.append_path_with_name(path, &root)?;
    }

    builder
        .into_inner()
        .map_err(|e| BoxenvError::Archive(format!("Failed to finish archive: {}", e)))
}

/// Extract an archive under `dir`. Entries escaping `dir` are skipped by `tar`.
pub fn unpack_into(bytes: &[u8], dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive
        .unpack(dir)
        .map_err(|e| BoxenvError::Archive(format!("Failed to extract into '{}': {}", dir.display(), e)))
}

/// Decompress gzip-compressed archives; plain tar passes through untouched.
pub fn decompress(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(bytes);
    }

    let mut decoder = flate2::read::GzDecoder::new(Cursor::new(bytes));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BoxenvError::Archive(format!("Failed to decompress archive: {}", e)))?;
    Ok(out)
}

fn normalize_entry_path(path: &Path) -> String {
    let path = path.to_string_lossy();
    let path = path.strip_prefix("./").unwrap_or(&path);
    path.trim_end_matches('/').to_string()
}

fn archive_error(e: std::io::Error) -> BoxenvError {
    BoxenvError::Archive(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn directory_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_mtime(1_700_000_000);
        builder
            .append_data(&mut dir, "project/", std::io::empty())
            .unwrap();

        let mut file = tar::Header::new_gnu();
        file.set_entry_type(tar::EntryType::Regular);
        file.set_size(5);
        file.set_mode(0o644);
        builder
            .append_data(&mut file, "project/main.py", &b"print"[..])
            .unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn test_single_file_entry() {
        let bytes = encode_file("note.txt", b"hello world").unwrap();
        let entries = decode(&bytes).unwrap();

        assert_eq!(
            entries,
            vec![ArchiveEntry {
                relative_path: "note.txt".to_string(),
                content: b"hello world".to_vec(),
                is_directory: false,
            }]
        );
    }

    #[test]
    fn test_decode_directory_tree() {
        let entries = decode(&directory_archive()).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "project");
        assert!(entries[0].is_directory);
        assert!(entries[0].content.is_empty());
        assert_eq!(entries[1].relative_path, "project/main.py");
        assert!(!entries[1].is_directory);
        assert_eq!(entries[1].content, b"print");
    }

    #[test]
    fn test_root_stat() {
        let stat = root_stat(&directory_archive()).unwrap();
        assert_eq!(stat.name, "project");
        assert_eq!(stat.mode, 0o755);
        assert_eq!(stat.mtime.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(stat.link_target, None);

        let stat = root_stat(&encode_file("a.bin", &[0u8; 42]).unwrap()).unwrap();
        assert_eq!(stat.name, "a.bin");
        assert_eq!(stat.size, 42);
        assert_eq!(stat.mode, FILE_MODE);
    }

    #[test]
    fn test_root_stat_of_empty_archive_fails() {
        assert!(root_stat(&[]).is_err());
    }

    #[test]
    fn test_pack_directory_has_single_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("logs");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("a.log"), "a").unwrap();
        std::fs::write(root.join("nested").join("b.log"), "bb").unwrap();

        let entries = decode(&pack_path(&root).unwrap()).unwrap();

        assert!(!entries.is_empty());
        assert!(entries
            .iter()
            .all(|e| e.relative_path == "logs" || e.relative_path.starts_with("logs/")));
        let nested = entries
            .iter()
            .find(|e| e.relative_path == "logs/nested/b.log")
            .unwrap();
        assert_eq!(nested.content, b"bb");
    }

    #[test]
    fn test_pack_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("config.json");
        std::fs::write(&file, "{}").unwrap();

        let entries = decode(&pack_path(&file).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "config.json");
        assert_eq!(entries[0].content, b"{}");
    }

    #[test]
    fn test_unpack_into() {
        let tmp = tempfile::tempdir().unwrap();
        unpack_into(&directory_archive(), tmp.path()).unwrap();

        let content = std::fs::read_to_string(tmp.path().join("project/main.py")).unwrap();
        assert_eq!(content, "print");
    }

    #[test]
    fn test_decompress_gzip() {
        let plain = encode_file("x.txt", b"x").unwrap();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).unwrap();
        let gz = encoder.finish().unwrap();

        assert_eq!(decompress(gz).unwrap(), plain);
        assert_eq!(decompress(plain.clone()).unwrap(), plain);
    }

    #[test]
    fn test_stream_chunks_cover_all_bytes() {
        let stream = ArchiveStream::new(vec![7u8; CHUNK_SIZE + 10]);
        let sizes: Vec<usize> = stream.chunks().map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, 10]);
    }
}
