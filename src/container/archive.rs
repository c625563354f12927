//! Tar archives for copying files into and out of containers.
//!
//! The engine's archive endpoints speak uncompressed tar. Entries carry
//! numeric ownership and mode so that files land in the data volume owned by
//! the tenant's uid rather than by root.

use crate::container::{ArchiveStream, EngineError, Owner, Result};
use futures::stream::StreamExt;
use std::io::Read;

/// Kind of an archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file with its content
    File(Vec<u8>),
    /// Directory
    Directory,
}

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative path inside the archive, `/`-separated
    pub path: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Owner uid
    pub uid: u32,
    /// Owner gid
    pub gid: u32,
    /// Permission bits
    pub mode: u32,
}

impl ArchiveEntry {
    /// A regular file.
    pub fn file<S: Into<String>>(path: S, data: Vec<u8>, owner: Owner, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File(data),
            uid: owner.uid,
            gid: owner.gid,
            mode,
        }
    }

    /// A directory.
    pub fn directory<S: Into<String>>(path: S, owner: Owner, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            uid: owner.uid,
            gid: owner.gid,
            mode,
        }
    }

    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// Build an uncompressed tar archive from entries, in order.
pub fn pack(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_uid(u64::from(entry.uid));
        header.set_gid(u64::from(entry.gid));
        header.set_mode(entry.mode);

        match &entry.kind {
            EntryKind::File(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, &entry.path, data.as_slice())
                    .map_err(|e| archive_error("pack", &entry.path, e))?;
            }
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                let path = format!("{}/", entry.path.trim_end_matches('/'));
                builder
                    .append_data(&mut header, &path, std::io::empty())
                    .map_err(|e| archive_error("pack", &entry.path, e))?;
            }
        }
    }

    builder
        .into_inner()
        .map_err(|e| EngineError::Archive(format!("Failed to finish archive: {e}")))
}

/// Read every regular file and directory out of a tar archive.
///
/// Other entry kinds (links, devices) are skipped.
pub fn unpack(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = Vec::new();

    let members = archive
        .entries()
        .map_err(|e| EngineError::Archive(format!("Failed to read archive: {e}")))?;

    for member in members {
        let mut member =
            member.map_err(|e| EngineError::Archive(format!("Failed to read entry: {e}")))?;
        let path = member
            .path()
            .map_err(|e| EngineError::Archive(format!("Invalid entry path: {e}")))?
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        let header = member.header();
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;
        let mode = header.mode().unwrap_or(0o644);

        let kind = match header.entry_type() {
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::new();
                member
                    .read_to_end(&mut data)
                    .map_err(|e| archive_error("unpack", &path, e))?;
                EntryKind::File(data)
            }
            _ => continue,
        };

        entries.push(ArchiveEntry {
            path,
            kind,
            uid,
            gid,
            mode,
        });
    }

    Ok(entries)
}

/// Drain an archive stream into memory.
///
/// Returns `Ok(None)` as soon as more than `ceiling` bytes have arrived; the
/// rest of the stream is dropped.
pub async fn collect(mut stream: ArchiveStream, ceiling: usize) -> Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buffer.len() + chunk.len() > ceiling {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Some(buffer))
}

fn archive_error(action: &str, path: &str, err: std::io::Error) -> EngineError {
    EngineError::Archive(format!("Failed to {action} {path}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_pack_preserves_ownership_and_mode() {
        let owner = Owner::new(1000);
        let entries = vec![
            ArchiveEntry::directory("notes", owner, 0o755),
            ArchiveEntry::file("notes/a.txt", b"hello".to_vec(), owner, 0o644),
        ];

        let unpacked = unpack(&pack(&entries).unwrap()).unwrap();

        assert_eq!(unpacked, entries);
        assert!(unpacked[0].is_dir());
    }

    #[test]
    fn test_unpack_garbage_fails() {
        let garbage = vec![0xffu8; 1024];
        assert!(matches!(unpack(&garbage), Err(EngineError::Archive(_))));
    }

    #[tokio::test]
    async fn test_collect_respects_ceiling() {
        let chunks = || stream::iter(vec![Ok(vec![0u8; 600]), Ok(vec![0u8; 600])]);

        let under: ArchiveStream = Box::pin(chunks());
        assert_eq!(collect(under, 2048).await.unwrap().map(|b| b.len()), Some(1200));

        let over: ArchiveStream = Box::pin(chunks());
        assert!(collect(over, 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collect_propagates_stream_errors() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(vec![1, 2, 3]),
            Err(EngineError::NotFound("gone".to_string())),
        ];
        let failing: ArchiveStream = Box::pin(stream::iter(chunks));

        assert!(matches!(
            collect(failing, 1024).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
