//! Block devices and superblock discovery.

use asupersync::Cx;
use rfs_error::{Result, RfsError};
use rfs_ondisk::Superblock;
use rfs_types::{PhysicalAddr, SUPERBLOCK_OFFSETS, SUPERBLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| RfsError::Cancelled)
}

/// Fixed-offset I/O on one physical device.
pub trait BlockDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> PhysicalAddr;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &[u8]) -> Result<()>;
}

/// In-memory device backing for tests and image slices.
pub struct MemoryDevice {
    data: parking_lot::RwLock<Vec<u8>>,
}

impl MemoryDevice {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: parking_lot::RwLock::new(data),
        }
    }

    fn span(&self, offset: PhysicalAddr, len: usize) -> Result<std::ops::Range<usize>> {
        let beg = usize::try_from(offset.0)
            .map_err(|_| io_err("negative offset on memory device"))?;
        let end = beg
            .checked_add(len)
            .ok_or_else(|| io_err("offset overflow on memory device"))?;
        if end > self.data.read().len() {
            return Err(io_err("read/write past end of memory device"));
        }
        Ok(beg..end)
    }
}

fn io_err(msg: &str) -> RfsError {
    RfsError::from(io::Error::new(io::ErrorKind::UnexpectedEof, msg.to_owned()))
}

impl BlockDevice for MemoryDevice {
    fn len_bytes(&self) -> PhysicalAddr {
        PhysicalAddr(self.data.read().len() as i64)
    }

    fn read_exact_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.data.read()[span]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let span = self.span(offset, buf.len())?;
        self.data.write()[span].copy_from_slice(buf);
        Ok(())
    }
}

/// A device backed by a file or block special, using pread/pwrite.
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(target: "rfs::volume", path = %path.display(), len, "opened device");
        Ok(Self { file, len })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(target: "rfs::volume", path = %path.display(), len, "opened device read-only");
        Ok(Self { file, len })
    }
}

impl BlockDevice for FileDevice {
    fn len_bytes(&self) -> PhysicalAddr {
        PhysicalAddr(self.len as i64)
    }

    fn read_exact_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let offset = u64::try_from(offset.0)
            .map_err(|_| io_err("negative offset on file device"))?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: PhysicalAddr, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let offset = u64::try_from(offset.0)
            .map_err(|_| io_err("negative offset on file device"))?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

/// Read and verify the superblock, preferring the highest-generation
/// valid mirror.
///
/// Mirrors that fall past the end of the device are skipped; mirrors that
/// fail checksum or parse are collected and reported only if no mirror
/// survives.
pub fn read_superblock(cx: &Cx, dev: &dyn BlockDevice) -> Result<Superblock> {
    let mut best: Option<Superblock> = None;
    let mut errs = Vec::new();

    for offset in SUPERBLOCK_OFFSETS {
        cx_checkpoint(cx)?;
        let end = offset.saturating_add(SUPERBLOCK_SIZE as u64);
        if i64::try_from(end).map_or(true, |end| end > dev.len_bytes().0) {
            continue;
        }
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        if let Err(err) = dev.read_exact_at(cx, PhysicalAddr(offset as i64), &mut region) {
            errs.push(err);
            continue;
        }
        let parsed = Superblock::verify_checksum(&region)
            .and_then(|()| Superblock::parse(&region))
            .map_err(RfsError::from);
        match parsed {
            Ok(sb) => {
                if best
                    .as_ref()
                    .map_or(true, |prev| sb.generation > prev.generation)
                {
                    best = Some(sb);
                }
            }
            Err(err) => {
                warn!(target: "rfs::volume", offset, %err, "superblock mirror rejected");
                errs.push(err);
            }
        }
    }

    match best {
        Some(sb) => Ok(sb),
        None => {
            RfsError::aggregate(errs, Some(io_err("no valid superblock mirror")))
                .map(|()| unreachable!("aggregate of a non-empty error list"))
        }
    }
}
