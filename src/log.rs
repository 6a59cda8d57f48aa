//! Append-only log file underneath the log-structured store.
//!
//! The file starts with two alternating superblocks followed by the data
//! region. Logical offset 0 maps to the first byte after the superblocks,
//! and offsets only ever grow; reclaimed space ahead of the head watermark
//! is returned to the filesystem by punching holes a whole segment at a
//! time.
//!
//! # Superblock Format
//!
//! ```text
//! +-----------+-------------+----------+----------+---------------+-----------+
//! | magic:u32 | version:u32 | head:u64 | tail:u64 | timestamp:u64 | crc32:u32 |
//! +-----------+-------------+----------+----------+---------------+-----------+
//! ```
//!
//! The timestamp is a commit counter; on open the superblock with the newer
//! timestamp and a valid checksum wins. Commits fsync the data region and
//! then rewrite the *alternate* superblock, so a torn superblock write can
//! never lose the previous consistent state.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 4096;
pub const SUPERBLOCK_SIZE: u64 = 4096;
pub const LOG_HEADER_SIZE: u64 = SUPERBLOCK_SIZE * 2;

const SUPERBLOCK_MAGIC: u32 = 0x454d_4252;
const LOG_VERSION: u32 = 0;
const SB_PAYLOAD_SIZE: usize = 32;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Offset value meaning "no offset posted".
pub const EXPIRED_OFFSET: u64 = u64::MAX;

struct LogInner {
    file: File,
    commit_seq: u64,
    punched: u64,
}

/// Append-only segmented log file with head/tail watermarks.
pub struct Log {
    head: AtomicU64,
    tail: AtomicU64,
    segment_size: u64,
    hole_punch: bool,
    inner: Mutex<LogInner>,
}

impl Log {
    pub fn open(path: &Path, segment_size: u64) -> Result<Log> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let (head, tail, commit_seq) = if len < LOG_HEADER_SIZE {
            // Fresh file: seed both superblocks.
            let log = LogState {
                head: 0,
                tail: 0,
                seq: 1,
            };
            write_superblock(&file, 0, &log)?;
            write_superblock(&file, 1, &log)?;
            file.sync_all()?;
            (0, 0, 1)
        } else {
            let sb0 = read_superblock(&file, 0)?;
            let sb1 = read_superblock(&file, 1)?;
            let state = match (sb0, sb1) {
                (Some(a), Some(b)) => {
                    if a.seq >= b.seq {
                        a
                    } else {
                        b
                    }
                }
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => return Err(Error::CorruptSuperBlock),
            };
            (state.head, state.tail, state.seq)
        };

        Ok(Log {
            head: AtomicU64::new(head),
            tail: AtomicU64::new(tail),
            segment_size,
            hole_punch: cfg!(target_os = "linux"),
            inner: Mutex::new(LogInner {
                file,
                commit_seq,
                punched: head / segment_size.max(1) * segment_size,
            }),
        })
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.tail() - self.head()
    }

    /// Append bytes at the tail, returning the logical offset they landed
    /// at. Appends are serialized by the flush-buffer chain; the lock here
    /// only orders them against commits.
    pub fn append(&self, bs: &[u8]) -> Result<u64> {
        use std::os::unix::fs::FileExt;

        let inner = self.inner.lock()?;
        let off = self.tail.load(Ordering::Acquire);
        inner.file.write_all_at(bs, LOG_HEADER_SIZE + off)?;
        self.tail.store(off + bs.len() as u64, Ordering::Release);
        Ok(off)
    }

    /// Read into `buf` starting at a logical offset. Reads past the end of
    /// the file are zero-filled; callers frame their own payload lengths.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let inner = self.inner.lock()?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let n = inner
                .file
                .read_at(&mut buf[pos..], LOG_HEADER_SIZE + offset + pos as u64)?;
            if n == 0 {
                for b in &mut buf[pos..] {
                    *b = 0;
                }
                break;
            }
            pos += n;
        }
        Ok(())
    }

    /// Advance the head watermark and punch holes in whole segments below
    /// it. The watermark is persisted by the next commit.
    pub fn trim(&self, offset: u64) {
        if offset == EXPIRED_OFFSET {
            return;
        }
        let prev = self.head.load(Ordering::Acquire);
        if offset <= prev {
            return;
        }
        self.head.store(offset, Ordering::Release);

        if !self.hole_punch || self.segment_size == 0 {
            return;
        }
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let boundary = offset / self.segment_size * self.segment_size;
        if boundary > inner.punched {
            self.punch_hole(&inner.file, inner.punched, boundary - inner.punched);
            inner.punched = boundary;
        }
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, file: &File, offset: u64, len: u64) {
        use std::os::unix::io::AsRawFd;

        let ret = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                (LOG_HEADER_SIZE + offset) as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret != 0 {
            tracing::debug!(offset, len, "hole punch not applied");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _file: &File, _offset: u64, _len: u64) {}

    /// Fsync the data region and persist head/tail into the alternate
    /// superblock.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.file.sync_data()?;

        inner.commit_seq += 1;
        let state = LogState {
            head: self.head.load(Ordering::Acquire),
            tail: self.tail.load(Ordering::Acquire),
            seq: inner.commit_seq,
        };
        let slot = inner.commit_seq % 2;
        write_superblock(&inner.file, slot, &state)?;
        inner.file.sync_data()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.commit()
    }
}

struct LogState {
    head: u64,
    tail: u64,
    seq: u64,
}

fn write_superblock(file: &File, slot: u64, state: &LogState) -> Result<()> {
    use std::os::unix::fs::FileExt;

    let mut bs = [0u8; SB_PAYLOAD_SIZE + 4];
    BigEndian::write_u32(&mut bs[0..4], SUPERBLOCK_MAGIC);
    BigEndian::write_u32(&mut bs[4..8], LOG_VERSION);
    BigEndian::write_u64(&mut bs[8..16], state.head);
    BigEndian::write_u64(&mut bs[16..24], state.tail);
    BigEndian::write_u64(&mut bs[24..32], state.seq);
    let crc = CRC32.checksum(&bs[..SB_PAYLOAD_SIZE]);
    BigEndian::write_u32(&mut bs[SB_PAYLOAD_SIZE..], crc);

    file.write_all_at(&bs, slot * SUPERBLOCK_SIZE)?;
    Ok(())
}

fn read_superblock(file: &File, slot: u64) -> Result<Option<LogState>> {
    use std::os::unix::fs::FileExt;

    let mut bs = [0u8; SB_PAYLOAD_SIZE + 4];
    file.read_exact_at(&mut bs, slot * SUPERBLOCK_SIZE)?;

    let crc = CRC32.checksum(&bs[..SB_PAYLOAD_SIZE]);
    if BigEndian::read_u32(&bs[SB_PAYLOAD_SIZE..]) != crc {
        return Ok(None);
    }
    if BigEndian::read_u32(&bs[0..4]) != SUPERBLOCK_MAGIC {
        return Ok(None);
    }
    Ok(Some(LogState {
        head: BigEndian::read_u64(&bs[8..16]),
        tail: BigEndian::read_u64(&bs[16..24]),
        seq: BigEndian::read_u64(&bs[24..32]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_log(dir: &TempDir) -> Log {
        Log::open(&dir.path().join("log.data"), 1024 * 1024).expect("failed to open log")
    }

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        let off1 = log.append(b"hello").unwrap();
        let off2 = log.append(b"world").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 5);
        assert_eq!(log.tail(), 10);

        let mut buf = [0u8; 5];
        log.read(&mut buf, off2).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_past_eof_zero_fills() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.append(b"ab").unwrap();

        let mut buf = [0xffu8; 8];
        log.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(&buf[2..], &[0u8; 6]);
    }

    #[test]
    fn test_commit_persists_watermarks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.data");
        {
            let log = Log::open(&path, 1024).unwrap();
            log.append(b"0123456789").unwrap();
            log.trim(4);
            log.commit().unwrap();
        }
        let log = Log::open(&path, 1024).unwrap();
        assert_eq!(log.head(), 4);
        assert_eq!(log.tail(), 10);
        assert_eq!(log.size(), 6);
    }

    #[test]
    fn test_uncommitted_tail_not_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.data");
        {
            let log = Log::open(&path, 1024).unwrap();
            log.append(b"committed").unwrap();
            log.commit().unwrap();
            log.append(b"lost").unwrap();
            // no commit
        }
        let log = Log::open(&path, 1024).unwrap();
        assert_eq!(log.tail(), 9);
    }

    #[test]
    fn test_corrupt_both_superblocks() {
        use std::os::unix::fs::FileExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.data");
        {
            let log = Log::open(&path, 1024).unwrap();
            log.commit().unwrap();
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(b"garbage-garbage", 0).unwrap();
        file.write_all_at(b"garbage-garbage", SUPERBLOCK_SIZE)
            .unwrap();
        drop(file);

        match Log::open(&path, 1024) {
            Err(Error::CorruptSuperBlock) => {}
            other => panic!("expected CorruptSuperBlock, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_single_corrupt_superblock_recovers() {
        use std::os::unix::fs::FileExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.data");
        {
            let log = Log::open(&path, 1024).unwrap();
            log.append(b"data").unwrap();
            log.commit().unwrap();
        }
        // Clobber slot 0; slot 1 still holds the latest commit.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0u8; 36], 0).unwrap();
        drop(file);

        let log = Log::open(&path, 1024).unwrap();
        assert_eq!(log.tail(), 4);
    }
}
