//! Transaction buffer.
//!
//! Holds what a client transaction stored, in insertion order, until
//! `tpc_finish` copies it into the cache or `tpc_abort` drops it. Small
//! transactions stay in memory. Once the buffered data passes the spill
//! threshold, every entry moves to a file in the spill directory as a
//! stream of length-delimited [`proto::BufferedRecord`]s.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use rand::Rng;

use crate::proto;
use crate::types::Oid;

/// Buffered data size above which entries spill to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 4 * 1024 * 1024;

/// One buffered entry. `data` is `None` when the oid is only invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub oid: Oid,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct SpillFile {
    path: PathBuf,
    file: File,
}

#[derive(Debug)]
pub struct TransactionBuffer {
    spill_dir: Option<PathBuf>,
    threshold: usize,
    memory: Vec<BufferedEntry>,
    spill: Option<SpillFile>,
    count: usize,
    bytes: usize,
    /// Blob files staged by `store_blob`, moved into the blob cache on
    /// finish.
    blobs: Vec<(Oid, PathBuf)>,
}

impl TransactionBuffer {
    /// A buffer that spills to `spill_dir` past `threshold` bytes. With no
    /// directory it never spills.
    #[must_use]
    pub const fn new(spill_dir: Option<PathBuf>, threshold: usize) -> Self {
        Self {
            spill_dir,
            threshold,
            memory: Vec::new(),
            spill: None,
            count: 0,
            bytes: 0,
            blobs: Vec::new(),
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn store(&mut self, oid: Oid, data: Vec<u8>) -> io::Result<()> {
        self.push(BufferedEntry {
            oid,
            data: Some(data),
        })
    }

    /// Record that `oid` changes in this transaction without new data
    /// (undo, delete).
    pub fn invalidate(&mut self, oid: Oid) -> io::Result<()> {
        self.push(BufferedEntry { oid, data: None })
    }

    /// Stage a blob file to install under `oid` once the commit tid is known.
    pub fn stage_blob(&mut self, oid: Oid, path: PathBuf) {
        self.blobs.push((oid, path));
    }

    #[must_use]
    pub fn blobs(&self) -> &[(Oid, PathBuf)] {
        &self.blobs
    }

    fn push(&mut self, entry: BufferedEntry) -> io::Result<()> {
        self.count += 1;
        self.bytes += entry.data.as_ref().map_or(0, Vec::len);
        if let Some(spill) = &mut self.spill {
            return write_entry(&mut spill.file, &entry);
        }
        self.memory.push(entry);
        if self.bytes > self.threshold {
            if let Some(dir) = self.spill_dir.clone() {
                self.start_spill(&dir)?;
            }
        }
        Ok(())
    }

    fn start_spill(&mut self, dir: &Path) -> io::Result<()> {
        let nonce: u64 = rand::rng().random();
        let path = dir.join(format!("tbuf-{nonce:016x}.spill"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        for entry in &self.memory {
            write_entry(&mut file, entry)?;
        }
        tracing::debug!(
            "transaction buffer spilled {} entries to {}",
            self.memory.len(),
            path.display()
        );
        self.memory.clear();
        self.spill = Some(SpillFile { path, file });
        Ok(())
    }

    /// Every entry in insertion order.
    pub fn entries(&mut self) -> io::Result<Vec<BufferedEntry>> {
        let Some(spill) = &mut self.spill else {
            return Ok(self.memory.clone());
        };
        spill.file.flush()?;
        spill.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        spill.file.read_to_end(&mut bytes)?;
        spill.file.seek(SeekFrom::End(0))?;

        let mut entries = Vec::with_capacity(self.count);
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let record = proto::BufferedRecord::decode_length_delimited(&mut rest)
                .map_err(io::Error::other)?;
            let oid = Oid::try_from(record.oid.as_slice()).map_err(io::Error::other)?;
            entries.push(BufferedEntry {
                oid,
                data: record.data,
            });
        }
        Ok(entries)
    }

    /// Forget everything. Staged blob files that were not installed are
    /// deleted.
    pub fn clear(&mut self) {
        self.memory.clear();
        self.count = 0;
        self.bytes = 0;
        if let Some(spill) = self.spill.take() {
            drop(spill.file);
            if let Err(e) = std::fs::remove_file(&spill.path) {
                tracing::warn!("could not remove {}: {e}", spill.path.display());
            }
        }
        for (_, path) in self.blobs.drain(..) {
            if !path.exists() {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("could not remove staged blob {}: {e}", path.display());
            }
        }
    }

    pub fn close(&mut self) {
        self.clear();
    }
}

impl Drop for TransactionBuffer {
    fn drop(&mut self) {
        if let Some(spill) = self.spill.take() {
            drop(spill.file);
            let _ = std::fs::remove_file(&spill.path);
        }
    }
}

fn write_entry(file: &mut File, entry: &BufferedEntry) -> io::Result<()> {
    let record = proto::BufferedRecord {
        oid: entry.oid.0.to_vec(),
        data: entry.data.clone(),
    };
    file.write_all(&record.encode_length_delimited_to_vec())
}
