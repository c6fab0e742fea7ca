#![forbid(unsafe_code)]
//! Block I/O layer for read-side ext4 interpretation.
//!
//! Provides byte-addressed devices (file, memory, and a partition window
//! bound to a starting LBA), the `BlockDevice` trait that slices a device
//! into filesystem blocks, and the pinned ARC buffer cache in [`cache`].

pub mod cache;

pub use cache::{BlockGuard, BufferCache, CacheStats, DetachedBlock, PinnedArcCache};

use e4_error::{Ext4Error, Result};
use e4_types::{BlockNumber, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sector size the LBA arithmetic is tuned for.
pub const NATIVE_SECTOR_SIZE: u32 = 512;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn out_of_bounds(offset: u64, len: usize, dev_len: u64) -> Ext4Error {
    Ext4Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read out of bounds: offset={offset} len={len} device_len={dev_len}"),
    ))
}

fn checked_end(offset: u64, len: usize) -> Result<u64> {
    u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| Ext4Error::Parse("read range overflows u64".to_owned()))
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Native sector size of the underlying medium.
    fn sector_size(&self) -> u32 {
        NATIVE_SECTOR_SIZE
    }
}

impl<T: ByteDevice + ?Sized> ByteDevice for Box<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
}

/// Read-only file-backed byte device using `pread` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(out_of_bounds(offset, buf.len(), self.len));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device for synthetic images.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    sector_size: u32,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            sector_size: NATIVE_SECTOR_SIZE,
        }
    }

    #[must_use]
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Overwrite bytes at `offset`; used to lay out test images.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                out_of_bounds(offset as u64, data.len(), bytes.len() as u64)
            })?;
        bytes[offset..end].copy_from_slice(data);
        drop(bytes);
        Ok(())
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).ok();
        let range = start.and_then(|s| s.checked_add(buf.len()).map(|e| (s, e)));
        match range {
            Some((start, end)) if end <= bytes.len() => {
                buf.copy_from_slice(&bytes[start..end]);
                drop(bytes);
                Ok(())
            }
            _ => Err(out_of_bounds(offset, buf.len(), bytes.len() as u64)),
        }
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

/// Identity of the device a filesystem instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub device_id: String,
    pub start_lba: u64,
    pub sector_size: u32,
}

impl DeviceBinding {
    #[must_use]
    pub fn new(device_id: impl Into<String>, start_lba: u64) -> Self {
        Self {
            device_id: device_id.into(),
            start_lba,
            sector_size: NATIVE_SECTOR_SIZE,
        }
    }

    /// Byte offset of the partition start on the raw device.
    pub fn start_offset(&self) -> Result<u64> {
        self.start_lba
            .checked_mul(u64::from(self.sector_size))
            .ok_or_else(|| Ext4Error::Parse("partition start offset overflows u64".to_owned()))
    }
}

/// Window onto a raw device starting at a bound LBA.
///
/// Offsets passed to [`ByteDevice::read_exact_at`] are relative to the
/// partition start, so the superblock is always found at byte 1024.
#[derive(Debug)]
pub struct PartitionDevice<D: ByteDevice> {
    inner: D,
    binding: DeviceBinding,
    start: u64,
    len: u64,
}

impl<D: ByteDevice> PartitionDevice<D> {
    /// Bind `inner` at `start_lba`, extending to the end of the device.
    ///
    /// A sector size other than 512 bytes is accepted with a warning.
    pub fn new(inner: D, device_id: impl Into<String>, start_lba: u64) -> Result<Self> {
        let mut binding = DeviceBinding::new(device_id, start_lba);
        binding.sector_size = inner.sector_size();
        if binding.sector_size == 0 {
            return Err(Ext4Error::Parse(format!(
                "device {} reports a zero sector size",
                binding.device_id
            )));
        }
        if binding.sector_size != NATIVE_SECTOR_SIZE {
            warn!(
                device = %binding.device_id,
                sector_size = binding.sector_size,
                "device sector size is not 512 bytes; reads will be less efficient"
            );
        }

        let start = binding.start_offset()?;
        let total = inner.len_bytes();
        if start > total {
            return Err(Ext4Error::UnsupportedFeature(format!(
                "partition start {start} lies beyond the end of device {} ({total} bytes)",
                binding.device_id
            )));
        }
        debug!(
            device = %binding.device_id,
            start_lba,
            start_offset = start,
            "bound partition window"
        );
        Ok(Self {
            len: total - start,
            inner,
            binding,
            start,
        })
    }

    /// Clamp the window to `sectors` sectors.
    #[must_use]
    pub fn with_len_sectors(mut self, sectors: u64) -> Self {
        let limit = sectors.saturating_mul(u64::from(self.binding.sector_size));
        self.len = self.len.min(limit);
        self
    }

    #[must_use]
    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> ByteDevice for PartitionDevice<D> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        if end > self.len {
            return Err(out_of_bounds(offset, buf.len(), self.len));
        }
        self.inner.read_exact_at(self.start + offset, buf)
    }

    fn sector_size(&self) -> u32 {
        self.binding.sector_size
    }
}

/// Block-addressed read interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of whole blocks.
    fn block_count(&self) -> u64;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Slice `inner` into `block_size` blocks. A trailing partial block is
    /// not addressable.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Ext4Error::Parse(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(Ext4Error::BlockUnavailable {
                block: block.0,
                detail: format!("beyond device end (block_count={})", self.block_count),
            });
        }
        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| Ext4Error::BlockUnavailable {
                block: block.0,
                detail: "block offset overflow".to_owned(),
            })?;
        let len = usize::try_from(self.block_size)
            .map_err(|_| Ext4Error::Parse("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Read the ext4 superblock region (1024 bytes at offset 1024).
pub fn read_ext4_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT4_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT4_SUPERBLOCK_SIZE];
    dev.read_exact_at(EXT4_SUPERBLOCK_OFFSET as u64, &mut buf)?;
    Ok(buf)
}

/// Read the first sector of a raw device, where an MBR would live.
pub fn read_sector0(dev: &dyn ByteDevice) -> Result<[u8; NATIVE_SECTOR_SIZE as usize]> {
    let mut buf = [0_u8; NATIVE_SECTOR_SIZE as usize];
    dev.read_exact_at(0, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_reads_blocks() {
        let mem = MemoryByteDevice::new(4096 * 4);
        mem.write_at(4096 * 2, &[7_u8; 4096]).unwrap();
        let dev = ByteBlockDevice::new(mem, 4096).unwrap();
        assert_eq!(dev.block_count(), 4);
        let read = dev.read_block(BlockNumber(2)).unwrap();
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
    }

    #[test]
    fn block_past_end_is_unavailable() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(4096), 1024).unwrap();
        let err = dev.read_block(BlockNumber(4)).unwrap_err();
        assert!(matches!(err, Ext4Error::BlockUnavailable { block: 4, .. }));
    }

    #[test]
    fn trailing_partial_block_is_ignored() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(2500), 1024).unwrap();
        assert_eq!(dev.block_count(), 2);
    }

    #[test]
    fn invalid_block_size_rejected() {
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(4096), 1000).is_err());
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(4096), 0).is_err());
    }

    #[test]
    fn partition_window_offsets_reads() {
        let mem = MemoryByteDevice::new(512 * 16);
        mem.write_at(512 * 4 + 10, b"inside").unwrap();
        let part = PartitionDevice::new(mem, "mem0", 4).unwrap();
        assert_eq!(part.len_bytes(), 512 * 12);
        assert_eq!(part.binding().start_lba, 4);

        let mut buf = [0_u8; 6];
        part.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"inside");

        let mut past = [0_u8; 8];
        assert!(part.read_exact_at(512 * 12 - 4, &mut past).is_err());
    }

    #[test]
    fn partition_window_clamps_to_sector_count() {
        let mem = MemoryByteDevice::new(512 * 16);
        let part = PartitionDevice::new(mem, "mem0", 2)
            .unwrap()
            .with_len_sectors(3);
        assert_eq!(part.len_bytes(), 512 * 3);
    }

    #[test]
    fn odd_sector_size_is_not_fatal() {
        let mem = MemoryByteDevice::new(4096 * 8).with_sector_size(4096);
        let part = PartitionDevice::new(mem, "mem4k", 1).unwrap();
        assert_eq!(part.sector_size(), 4096);
        assert_eq!(part.len_bytes(), 4096 * 7);
    }

    #[test]
    fn partition_start_past_end_is_rejected() {
        let mem = MemoryByteDevice::new(1024);
        assert!(matches!(
            PartitionDevice::new(mem, "tiny", 10),
            Err(Ext4Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn superblock_region_read() {
        let mem = MemoryByteDevice::new(4096);
        mem.write_at(1024 + 0x38, &0xEF53_u16.to_le_bytes()).unwrap();
        let region = read_ext4_superblock_region(&mem).unwrap();
        assert_eq!(u16::from_le_bytes([region[0x38], region[0x39]]), 0xEF53);
    }
}
