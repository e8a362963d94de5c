//! Blob directory layout.
//!
//! ```text
//! <root>/
//!   tmp/                                   staging area for new blobs
//!   <oid-hex>/
//!     <oid-hex>-<tid-hex>.blob             committed revision
//!     <oid-hex>-<tid-hex>-<random>.tmp     download in progress
//! ```
//!
//! A committed file only ever appears by rename, so a reader either sees no
//! file or a complete one.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::types::{Oid, Tid};

/// Size of the chunks blobs are streamed in.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;

const BLOB_SUFFIX: &str = ".blob";
const TEMP_SUFFIX: &str = ".tmp";

/// Maps `(oid, tid)` to paths inside a blob directory.
#[derive(Debug, Clone)]
pub struct BlobLayout {
    root: PathBuf,
}

impl BlobLayout {
    /// Use `root` as a blob directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for files not yet tied to a committed revision.
    #[must_use]
    pub fn temporary_directory(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[must_use]
    pub fn oid_dir(&self, oid: Oid) -> PathBuf {
        self.root.join(oid.to_hex())
    }

    /// Final location of a committed blob.
    #[must_use]
    pub fn path(&self, oid: Oid, tid: Tid) -> PathBuf {
        self.oid_dir(oid)
            .join(format!("{}-{}{BLOB_SUFFIX}", oid.to_hex(), tid.to_hex()))
    }

    /// A fresh temp file name next to the final location, so the final
    /// rename stays on one filesystem.
    pub fn temp_path(&self, oid: Oid, tid: Tid) -> io::Result<PathBuf> {
        let dir = self.oid_dir(oid);
        std::fs::create_dir_all(&dir)?;
        let nonce: u64 = rand::rng().random();
        Ok(dir.join(format!(
            "{}-{}-{nonce:016x}{TEMP_SUFFIX}",
            oid.to_hex(),
            tid.to_hex()
        )))
    }

    #[must_use]
    pub fn exists(&self, oid: Oid, tid: Tid) -> bool {
        self.path(oid, tid).is_file()
    }

    /// Move `source` to the final location of `(oid, tid)`.
    pub fn install(&self, source: &Path, oid: Oid, tid: Tid) -> io::Result<PathBuf> {
        std::fs::create_dir_all(self.oid_dir(oid))?;
        let target = self.path(oid, tid);
        std::fs::rename(source, &target)?;
        Ok(target)
    }

    /// Every committed revision of `oid` present on disk, oldest first.
    pub fn revisions(&self, oid: Oid) -> io::Result<Vec<Tid>> {
        let dir = self.oid_dir(oid);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-", oid.to_hex());
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(hex) = name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_suffix(BLOB_SUFFIX))
            else {
                continue;
            };
            if let Ok(n) = u64::from_str_radix(hex, 16) {
                tids.push(Tid::from_u64(n));
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }
}

/// Running CRC-32 and length of a blob stream.
#[derive(Default, Clone)]
pub struct BlobDigest {
    hasher: crc32fast::Hasher,
    length: u64,
}

impl std::fmt::Debug for BlobDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDigest")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl BlobDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.length += chunk.len() as u64;
    }

    /// `(crc32, length)`.
    #[must_use]
    pub fn finish(self) -> (u32, u64) {
        (self.hasher.finalize(), self.length)
    }
}

/// Read a file in [`BLOB_CHUNK_SIZE`] pieces, feeding each to `f`.
pub fn for_each_chunk(path: &Path, mut f: impl FnMut(&[u8]) -> io::Result<()>) -> io::Result<(u32, u64)> {
    let mut file = File::open(path)?;
    let mut digest = BlobDigest::new();
    let mut buf = vec![0u8; BLOB_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        f(&buf[..n])?;
    }
    Ok(digest.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let dir = tempdir().unwrap();
        let layout = BlobLayout::open(dir.path()).unwrap();
        let path = layout.path(Oid::from_u64(1), Tid::from_u64(0x20));
        assert_eq!(
            path,
            dir.path()
                .join("0000000000000001")
                .join("0000000000000001-0000000000000020.blob")
        );
        let tmp = layout.temp_path(Oid::from_u64(1), Tid::from_u64(0x20)).unwrap();
        assert_eq!(tmp.parent(), path.parent());
        assert!(tmp.to_string_lossy().ends_with(".tmp"));
        assert!(layout.temporary_directory().is_dir());
    }

    #[test]
    fn test_install_and_revisions() {
        let dir = tempdir().unwrap();
        let layout = BlobLayout::open(dir.path()).unwrap();
        let oid = Oid::from_u64(5);
        for tid in [3u64, 1, 2] {
            let tmp = layout.temp_path(oid, Tid::from_u64(tid)).unwrap();
            std::fs::write(&tmp, b"blob").unwrap();
            layout.install(&tmp, oid, Tid::from_u64(tid)).unwrap();
        }
        // A stray temp file is not a revision.
        std::fs::write(layout.temp_path(oid, Tid::from_u64(9)).unwrap(), b"x").unwrap();

        assert!(layout.exists(oid, Tid::from_u64(2)));
        assert_eq!(
            layout.revisions(oid).unwrap(),
            vec![Tid::from_u64(1), Tid::from_u64(2), Tid::from_u64(3)]
        );
        assert!(layout.revisions(Oid::from_u64(6)).unwrap().is_empty());
    }

    #[test]
    fn test_chunked_digest_matches_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let data: Vec<u8> = (0..BLOB_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut seen = Vec::new();
        let (crc, len) = for_each_chunk(&path, |chunk| {
            seen.extend_from_slice(chunk);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, data);
        assert_eq!(len, data.len() as u64);
        assert_eq!(crc, crc32fast::hash(&data));
    }
}
