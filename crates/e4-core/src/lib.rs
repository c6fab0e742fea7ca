#![forbid(unsafe_code)]
//! Read-only view of a mounted ext4 volume.
//!
//! [`Ext4Fs`] ties the pieces together: the superblock and block group
//! table decoded at mount, inode reads through the group descriptors,
//! directory lookup, and byte reads through the block address resolver.
//! All block access goes through one pinned ARC buffer cache.

mod disk;
mod groups;

pub use disk::{DiskPlacement, locate_filesystem, select_partition};
pub use groups::BlockGroupTable;

pub use e4_block::{
    ByteDevice, CacheStats, DeviceBinding, FileByteDevice, MemoryByteDevice, PartitionDevice,
};
pub use e4_dir::DirEntryView;
pub use e4_error::{Ext4Error, Result};
pub use e4_ondisk::{Ext4GroupDesc, Ext4Inode, Ext4Superblock, FileKind};
pub use e4_types::InodeNumber;

use e4_block::{BufferCache, ByteBlockDevice, PinnedArcCache, read_ext4_superblock_region};
use e4_dir::{DirectoryLookup, HtreeParams};
use e4_ondisk::BlockMap;
use e4_types::{BlockNumber, ParseError, inode_index_in_group, inode_to_group, to_usize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, trace};

/// Options controlling how a volume is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Blocks held by the buffer cache.
    pub cache_capacity_blocks: usize,
    /// Check the superblock CRC32C when `metadata_csum` is enabled.
    pub verify_superblock_checksum: bool,
    /// Force signed (`false`) or unsigned (`true`) directory hashing.
    /// `None` follows the superblock flags.
    pub unsigned_hash_override: Option<bool>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_capacity_blocks: 256,
            verify_superblock_checksum: false,
            unsigned_hash_override: None,
        }
    }
}

/// An inode as seen through a directory lookup. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildView {
    pub ino: InodeNumber,
    pub mode: u16,
    pub kind: FileKind,
    pub size: u64,
    /// Allocated space in 512-byte units.
    pub blocks_512: u64,
    pub links: u16,
    #[serde(skip)]
    pub inode: Ext4Inode,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: u32,
    pub inode_table: u64,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
}

/// Everything `inspect` reports about a volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeSummary {
    pub device: DeviceBinding,
    pub volume_name: String,
    pub uuid: String,
    pub rev_level: u32,
    pub block_size: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub group_desc_size: u16,
    pub first_data_block: u32,
    pub first_ino: u32,
    pub features: Vec<String>,
    pub hash_seed: [u32; 4],
    pub default_hash_version: u8,
    pub unsigned_hash: bool,
    pub groups: Vec<GroupSummary>,
}

type VolumeCache = PinnedArcCache<ByteBlockDevice<Box<dyn ByteDevice>>>;

/// A mounted ext4 volume.
pub struct Ext4Fs {
    sb: Ext4Superblock,
    groups: BlockGroupTable,
    binding: DeviceBinding,
    options: MountOptions,
    cache: VolumeCache,
    /// Serializes byte copies out of the cache.
    read_lock: Mutex<()>,
}

impl std::fmt::Debug for Ext4Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext4Fs")
            .field("binding", &self.binding)
            .field("block_size", &self.sb.block_size)
            .field("groups", &self.groups.len())
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}

fn bad_superblock(err: &ParseError) -> Ext4Error {
    Ext4Error::BadSuperblock(err.to_string())
}

fn inode_read(ino: InodeNumber, detail: impl Into<String>) -> Ext4Error {
    Ext4Error::InodeRead {
        ino: ino.0,
        detail: detail.into(),
    }
}

impl Ext4Fs {
    /// Open an image file or disk, choosing the partition from its MBR.
    pub fn open(
        path: impl AsRef<Path>,
        partition: Option<u8>,
        options: &MountOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let dev = FileByteDevice::open(path)?;
        Self::open_disk(Box::new(dev), path.display().to_string(), partition, options)
    }

    /// Mount the volume on a whole-disk device.
    ///
    /// Without an MBR the device is a bare filesystem at LBA 0. Otherwise the
    /// first Linux partition is used, or `partition` (1-based) when given.
    pub fn open_disk(
        dev: Box<dyn ByteDevice>,
        device_id: impl Into<String>,
        partition: Option<u8>,
        options: &MountOptions,
    ) -> Result<Self> {
        let placement = locate_filesystem(&*dev, partition)?;
        let mut window = PartitionDevice::new(dev, device_id, placement.start_lba)?;
        if let Some(sectors) = placement.len_sectors {
            window = window.with_len_sectors(sectors);
        }
        Self::mount(window, options)
    }

    /// Mount a volume starting at `start_lba`, skipping partition probing.
    pub fn mount_at(
        dev: Box<dyn ByteDevice>,
        device_id: impl Into<String>,
        start_lba: u64,
        options: &MountOptions,
    ) -> Result<Self> {
        Self::mount(PartitionDevice::new(dev, device_id, start_lba)?, options)
    }

    /// Decode the superblock and block group table of `dev`.
    pub fn mount<D: ByteDevice + 'static>(
        dev: PartitionDevice<D>,
        options: &MountOptions,
    ) -> Result<Self> {
        let binding = dev.binding().clone();
        let region = read_ext4_superblock_region(&dev)?;
        let sb = Ext4Superblock::parse_superblock_region(&region).map_err(|e| bad_superblock(&e))?;
        sb.validate_geometry().map_err(|e| bad_superblock(&e))?;
        if options.verify_superblock_checksum {
            sb.validate_checksum(&region).map_err(|e| bad_superblock(&e))?;
        }
        debug!(
            device = %binding.device_id,
            block_size = sb.block_size.get(),
            blocks = sb.blocks_count,
            inodes = sb.inodes_count,
            blocks_per_group = sb.blocks_per_group,
            inodes_per_group = sb.inodes_per_group,
            inode_size = sb.inode_size,
            "superblock decoded"
        );

        let device: Box<dyn ByteDevice> = Box::new(dev);
        let blocks = ByteBlockDevice::new(device, sb.block_size.get())?;
        let cache = PinnedArcCache::new(blocks, options.cache_capacity_blocks)?;
        let groups = BlockGroupTable::build(&sb, &cache)?;

        info!(
            device = %binding.device_id,
            start_lba = binding.start_lba,
            volume = %sb.volume_name,
            groups = groups.len(),
            "ext4 volume mounted"
        );
        Ok(Self {
            sb,
            groups,
            binding,
            options: options.clone(),
            cache,
            read_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext4Superblock {
        &self.sb
    }

    #[must_use]
    pub fn groups(&self) -> &BlockGroupTable {
        &self.groups
    }

    #[must_use]
    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn htree_params(&self) -> HtreeParams {
        HtreeParams::from_superblock(&self.sb, self.options.unsigned_hash_override)
    }

    fn directory(&self) -> DirectoryLookup<'_> {
        DirectoryLookup::new(&self.cache, self.htree_params())
    }

    /// Read inode `ino` from its group's inode table.
    ///
    /// Inodes are not cached; every call reads through the buffer cache.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext4Inode> {
        if ino.0 == 0 {
            return Err(inode_read(ino, "inode numbers start at 1"));
        }
        let per_group = self.sb.inodes_per_group;
        let group = inode_to_group(ino, per_group);
        let index = inode_index_in_group(ino, per_group);
        let desc = self.groups.get(group).ok_or_else(|| {
            inode_read(
                ino,
                format!("group {group} beyond the {} groups of the volume", self.groups.len()),
            )
        })?;

        let bs = u64::from(self.sb.block_size.get());
        let record = usize::from(self.sb.inode_size);
        let byte_offset = self
            .sb
            .block_size
            .block_offset(BlockNumber(desc.inode_table))
            .and_then(|base| base.checked_add(u64::from(index) * u64::from(self.sb.inode_size)))
            .ok_or_else(|| inode_read(ino, "inode table offset overflows"))?;
        let block = byte_offset / bs;
        let within = to_usize(byte_offset % bs, "inode offset in block")
            .map_err(|e| inode_read(ino, e.to_string()))?;
        trace!(ino = ino.0, group = group.0, index, block, within, "inode location");

        let guard = self
            .cache
            .request_block(BlockNumber(block), false)
            .map_err(|e| inode_read(ino, format!("inode table block {block}: {e}")))?;
        let raw = guard
            .get(within..within + record)
            .ok_or_else(|| inode_read(ino, "inode record crosses the block end"))?;
        Ext4Inode::parse_from_bytes(raw).map_err(|e| inode_read(ino, e.to_string()))
    }

    /// File size in bytes. Directories always use both size words.
    #[must_use]
    pub fn file_size(&self, inode: &Ext4Inode) -> u64 {
        inode.size_bytes(inode.is_dir() || self.sb.has_large_file())
    }

    fn child_view(&self, ino: InodeNumber, inode: Ext4Inode) -> ChildView {
        ChildView {
            ino,
            mode: inode.mode,
            kind: inode.kind(),
            size: self.file_size(&inode),
            blocks_512: inode.blocks_512(self.sb.has_huge_file(), self.sb.block_size),
            links: inode.links_count,
            inode,
        }
    }

    /// View of inode `ino` without going through a directory.
    pub fn stat(&self, ino: InodeNumber) -> Result<ChildView> {
        let inode = self.read_inode(ino)?;
        Ok(self.child_view(ino, inode))
    }

    /// Find `name` in directory `dir_ino` and read the inode it names.
    pub fn lookup(&self, dir_ino: InodeNumber, name: &[u8]) -> Result<ChildView> {
        let dir = self.read_inode(dir_ino)?;
        let hit = self.directory().lookup(dir_ino, &dir, name)?;
        trace!(dir = dir_ino.0, child = hit.ino.0, "lookup hit");
        let inode = if hit.ino == dir_ino {
            dir
        } else {
            self.read_inode(hit.ino)?
        };
        Ok(self.child_view(hit.ino, inode))
    }

    /// List every live entry of directory `ino`.
    pub fn read_dir(&self, ino: InodeNumber) -> Result<Vec<DirEntryView>> {
        let dir = self.read_inode(ino)?;
        self.directory().read_dir(ino, &dir)
    }

    /// Walk an absolute path from the root directory.
    pub fn resolve_path(&self, path: &str) -> Result<ChildView> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(Ext4Error::Parse(format!("path {path:?} is not absolute")));
        };
        let mut current = self.stat(InodeNumber::ROOT)?;
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            if current.kind != FileKind::Directory {
                return Err(Ext4Error::NotDirectory);
            }
            current = self.lookup(current.ino, component.as_bytes())?;
        }
        Ok(current)
    }

    /// Copy file bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, clamped to the file size. Holes
    /// and uninitialized extents read as zeroes.
    pub fn read_data(&self, ino: InodeNumber, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _serial = self.read_lock.lock();
        let inode = self.read_inode(ino)?;
        let size = self.file_size(&inode);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let avail = size - offset;
        let want = usize::try_from(avail).map_or(buf.len(), |a| a.min(buf.len()));

        if let BlockMap::Inline(bytes) = &inode.block_map {
            let Some(start) = usize::try_from(offset).ok().filter(|&s| s < bytes.len()) else {
                return Ok(0);
            };
            let n = want.min(bytes.len() - start);
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            return Ok(n);
        }

        let bs = u64::from(self.sb.block_size.get());
        let mut done = 0_usize;
        while done < want {
            let pos = offset + done as u64;
            #[allow(clippy::cast_possible_truncation)] // below the block size
            let within = (pos % bs) as usize;
            let guard = e4_extent::resolve(&self.cache, ino, &inode, pos / bs, false)?;
            let n = (guard.len() - within).min(want - done);
            buf[done..done + n].copy_from_slice(&guard[within..within + n]);
            done += n;
        }
        trace!(ino = ino.0, offset, bytes = done, "data read");
        Ok(done)
    }

    /// Volume facts for display.
    #[must_use]
    pub fn summary(&self) -> VolumeSummary {
        let sb = &self.sb;
        VolumeSummary {
            device: self.binding.clone(),
            volume_name: sb.volume_name.clone(),
            uuid: format_uuid(&sb.uuid),
            rev_level: sb.rev_level,
            block_size: sb.block_size.get(),
            blocks_count: sb.blocks_count,
            free_blocks_count: sb.free_blocks_count,
            inodes_count: sb.inodes_count,
            free_inodes_count: sb.free_inodes_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            group_desc_size: sb.group_desc_size(),
            first_data_block: sb.first_data_block,
            first_ino: sb.first_ino,
            features: sb.features.names(),
            hash_seed: sb.hash_seed,
            default_hash_version: sb.def_hash_version,
            unsigned_hash: self.htree_params().unsigned_hash,
            groups: self
                .groups
                .iter()
                .map(|(group, desc)| GroupSummary {
                    group: group.0,
                    inode_table: desc.inode_table,
                    free_blocks: desc.free_blocks_count,
                    free_inodes: desc.free_inodes_count,
                    used_dirs: desc.used_dirs_count,
                })
                .collect(),
        }
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_formats_in_groups() {
        let uuid: [u8; 16] = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        assert_eq!(format_uuid(&uuid), "12345678-9abc-def0-0123-456789abcdef");
    }

    #[test]
    fn mount_options_fill_missing_fields() {
        let opts: MountOptions = serde_json::from_str(r#"{"cache_capacity_blocks": 8}"#).unwrap();
        assert_eq!(opts.cache_capacity_blocks, 8);
        assert!(!opts.verify_superblock_checksum);
        assert_eq!(opts.unsigned_hash_override, None);
    }
}
