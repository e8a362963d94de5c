//! On-disk layout of the client cache file.
//!
//! # File Format
//!
//! ```text
//! +---------+----------------------------------------------+
//! | 0-3     | magic "ZEC3"                                 |
//! | 4-11    | last_tid                                     |
//! | 12-N    | blocks, tiling the file up to its exact size |
//! +---------+----------------------------------------------+
//! ```
//!
//! Allocated block:
//!
//! ```text
//! +---------+----------------------------------------------+
//! | 0       | 'a'                                          |
//! | 1-4     | block size, including this header (u32)      |
//! | 5-12    | oid                                          |
//! | 13-20   | start tid                                    |
//! | 21-28   | end tid, zero while current                  |
//! | 29-N    | data                                         |
//! +---------+----------------------------------------------+
//! ```
//!
//! Free blocks are `'f'` followed by a u32 size. Free runs too short for that
//! header (1 to 4 bytes) are a single status byte `'1'`..`'4'`. All integers
//! are big-endian.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::cache::CacheError;
use crate::types::{ID_LEN, Oid, Tid};

pub const MAGIC: &[u8; 4] = b"ZEC3";

/// Magic plus last tid.
pub const HEADER_SIZE: u64 = 12;

/// Status, size, oid, start tid, end tid.
pub const RECORD_OVERHEAD: u64 = 29;

/// Status plus size.
pub const FREE_HEADER_SIZE: u64 = 5;

const STATUS_ALLOCATED: u8 = b'a';
const STATUS_FREE: u8 = b'f';

/// Random-access byte storage backing an arena: a real file, or a
/// growable buffer when the cache is a scratch cache.
pub trait Backing: Read + Write + Seek + Send {
    /// Grow or shrink to exactly `len` bytes.
    fn resize(&mut self, len: u64) -> io::Result<()>;

    /// Make previous writes durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl Backing for File {
    fn resize(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl Backing for Cursor<Vec<u8>> {
    fn resize(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One block header as found in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Record {
        size: u64,
        oid: Oid,
        start: Tid,
        end: Tid,
    },
    Free {
        size: u64,
    },
}

impl Block {
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::Record { size, .. } | Self::Free { size } => *size,
        }
    }
}

pub struct Arena {
    io: Box<dyn Backing>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena").finish_non_exhaustive()
    }
}

impl Arena {
    #[must_use]
    pub fn new(io: Box<dyn Backing>) -> Self {
        Self { io }
    }

    /// An arena over an in-memory buffer.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(Cursor::new(Vec::new())))
    }

    pub fn len(&mut self) -> io::Result<u64> {
        self.io.seek(SeekFrom::End(0))
    }

    pub fn resize(&mut self, len: u64) -> io::Result<()> {
        self.io.resize(len)
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.io.flush()?;
        self.io.sync()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.io.seek(SeekFrom::Start(offset))?;
        self.io.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.io.seek(SeekFrom::Start(offset))?;
        self.io.write_all(bytes)
    }

    /// Read the header. `None` if the file is too short or the magic is
    /// not ours.
    pub fn read_header(&mut self) -> io::Result<Option<Tid>> {
        if self.len()? < HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.read_at(0, &mut buf)?;
        if &buf[..4] != MAGIC {
            return Ok(None);
        }
        let mut tid = [0u8; ID_LEN];
        tid.copy_from_slice(&buf[4..]);
        Ok(Some(Tid(tid)))
    }

    pub fn write_header(&mut self, last_tid: Tid) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(last_tid.as_bytes());
        self.write_at(0, &buf)
    }

    pub fn write_last_tid(&mut self, last_tid: Tid) -> io::Result<()> {
        self.write_at(MAGIC.len() as u64, last_tid.as_bytes())
    }

    /// Decode the block header at `offset`.
    pub fn read_block(&mut self, offset: u64) -> Result<Block, CacheError> {
        let mut status = [0u8; 1];
        self.read_at(offset, &mut status)?;
        match status[0] {
            STATUS_ALLOCATED => {
                let mut buf = [0u8; RECORD_OVERHEAD as usize - 1];
                self.read_at(offset + 1, &mut buf)?;
                let size = u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                if size < RECORD_OVERHEAD {
                    return Err(CacheError::Corrupt {
                        offset,
                        message: format!("record size {size} below header size"),
                    });
                }
                let mut oid = [0u8; ID_LEN];
                let mut start = [0u8; ID_LEN];
                let mut end = [0u8; ID_LEN];
                oid.copy_from_slice(&buf[4..12]);
                start.copy_from_slice(&buf[12..20]);
                end.copy_from_slice(&buf[20..28]);
                Ok(Block::Record {
                    size,
                    oid: Oid(oid),
                    start: Tid(start),
                    end: Tid(end),
                })
            }
            STATUS_FREE => {
                let mut buf = [0u8; 4];
                self.read_at(offset + 1, &mut buf)?;
                let size = u64::from(u32::from_be_bytes(buf));
                if size < FREE_HEADER_SIZE {
                    return Err(CacheError::Corrupt {
                        offset,
                        message: format!("free block size {size} below header size"),
                    });
                }
                Ok(Block::Free { size })
            }
            digit @ b'1'..=b'4' => Ok(Block::Free {
                size: u64::from(digit - b'0'),
            }),
            other => Err(CacheError::Corrupt {
                offset,
                message: format!("unknown status byte 0x{other:02x}"),
            }),
        }
    }

    /// Read the data of the record whose block starts at `offset`.
    pub fn read_data(&mut self, offset: u64, block_size: u64) -> io::Result<Vec<u8>> {
        let len = usize::try_from(block_size - RECORD_OVERHEAD).map_err(io::Error::other)?;
        let mut data = vec![0u8; len];
        self.read_at(offset + RECORD_OVERHEAD, &mut data)?;
        Ok(data)
    }

    /// Mark `len` bytes at `offset` as free. A zero length writes nothing.
    pub fn write_free(&mut self, offset: u64, len: u64) -> io::Result<()> {
        match len {
            0 => Ok(()),
            1..=4 => {
                #[allow(clippy::cast_possible_truncation)] // len is at most 4
                let status = b'0' + len as u8;
                self.write_at(offset, &[status])
            }
            _ => {
                let size = u32::try_from(len).map_err(io::Error::other)?;
                let mut buf = [0u8; FREE_HEADER_SIZE as usize];
                buf[0] = STATUS_FREE;
                buf[1..].copy_from_slice(&size.to_be_bytes());
                self.write_at(offset, &buf)
            }
        }
    }

    /// Write a record at `offset`.
    ///
    /// The block is first written with a free status and flipped to
    /// allocated only once the body is in place, so a torn write reads back
    /// as free space.
    pub fn write_record(
        &mut self,
        offset: u64,
        oid: Oid,
        start: Tid,
        end: Tid,
        data: &[u8],
    ) -> io::Result<u64> {
        let size = RECORD_OVERHEAD + data.len() as u64;
        let size32 = u32::try_from(size).map_err(io::Error::other)?;
        let mut buf = Vec::with_capacity(RECORD_OVERHEAD as usize + data.len());
        buf.push(STATUS_FREE);
        buf.extend_from_slice(&size32.to_be_bytes());
        buf.extend_from_slice(oid.as_bytes());
        buf.extend_from_slice(start.as_bytes());
        buf.extend_from_slice(end.as_bytes());
        buf.extend_from_slice(data);
        self.write_at(offset, &buf)?;
        self.write_at(offset, &[STATUS_ALLOCATED])?;
        Ok(size)
    }

    /// Rewrite the end tid of the record at `offset` in place.
    pub fn set_end_tid(&mut self, offset: u64, end: Tid) -> io::Result<()> {
        self.write_at(offset + 21, end.as_bytes())
    }
}
