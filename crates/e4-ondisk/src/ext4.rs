#![forbid(unsafe_code)]

use e4_types::{
    BlockSize, EXT4_DIR_CSUM_FILE_TYPE, EXT4_EXTENT_MAGIC, EXT4_EXTENTS_FL, EXT4_HUGE_FILE_FL,
    EXT4_INDEX_FL, EXT4_INLINE_DATA_FL, EXT4_N_BLOCKS, EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_OFFSET,
    EXT4_SUPERBLOCK_SIZE, Fields, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT,
    S_IFREG,
};
use serde::{Deserialize, Serialize};

// ── Feature words ───────────────────────────────────────────────────────────

/// One feature bit, tagged with the superblock word that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Compat(u32),
    Incompat(u32),
    RoCompat(u32),
}

impl Feature {
    pub const BIT64: Self = Self::Incompat(0x0080);
    pub const LARGEDIR: Self = Self::Incompat(0x4000);
    pub const LARGE_FILE: Self = Self::RoCompat(0x0002);
    pub const HUGE_FILE: Self = Self::RoCompat(0x0008);
    pub const METADATA_CSUM: Self = Self::RoCompat(0x0400);
}

/// Names as `dumpe2fs` prints them.
const FEATURE_NAMES: &[(Feature, &str)] = &[
    (Feature::Compat(0x0001), "dir_prealloc"),
    (Feature::Compat(0x0002), "imagic_inodes"),
    (Feature::Compat(0x0004), "has_journal"),
    (Feature::Compat(0x0008), "ext_attr"),
    (Feature::Compat(0x0010), "resize_inode"),
    (Feature::Compat(0x0020), "dir_index"),
    (Feature::Compat(0x0200), "sparse_super2"),
    (Feature::Compat(0x0400), "fast_commit"),
    (Feature::Compat(0x0800), "stable_inodes"),
    (Feature::Compat(0x1000), "orphan_file"),
    (Feature::Incompat(0x0001), "compression"),
    (Feature::Incompat(0x0002), "filetype"),
    (Feature::Incompat(0x0004), "needs_recovery"),
    (Feature::Incompat(0x0008), "journal_dev"),
    (Feature::Incompat(0x0010), "meta_bg"),
    (Feature::Incompat(0x0040), "extent"),
    (Feature::BIT64, "64bit"),
    (Feature::Incompat(0x0100), "mmp"),
    (Feature::Incompat(0x0200), "flex_bg"),
    (Feature::Incompat(0x0400), "ea_inode"),
    (Feature::Incompat(0x1000), "dirdata"),
    (Feature::Incompat(0x2000), "metadata_csum_seed"),
    (Feature::LARGEDIR, "large_dir"),
    (Feature::Incompat(0x8000), "inline_data"),
    (Feature::Incompat(0x1_0000), "encrypt"),
    (Feature::Incompat(0x2_0000), "casefold"),
    (Feature::RoCompat(0x0001), "sparse_super"),
    (Feature::LARGE_FILE, "large_file"),
    (Feature::HUGE_FILE, "huge_file"),
    (Feature::RoCompat(0x0010), "uninit_bg"),
    (Feature::RoCompat(0x0020), "dir_nlink"),
    (Feature::RoCompat(0x0040), "extra_isize"),
    (Feature::RoCompat(0x0100), "quota"),
    (Feature::RoCompat(0x0200), "bigalloc"),
    (Feature::METADATA_CSUM, "metadata_csum"),
    (Feature::RoCompat(0x1000), "read-only"),
    (Feature::RoCompat(0x2000), "project"),
    (Feature::RoCompat(0x8000), "verity"),
    (Feature::RoCompat(0x1_0000), "orphan_present"),
];

/// `s_feature_compat`, `s_feature_incompat` and `s_feature_ro_compat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub compat: u32,
    pub incompat: u32,
    pub ro_compat: u32,
}

impl Features {
    fn word(self, feature: Feature) -> (u32, u32) {
        match feature {
            Feature::Compat(bit) => (self.compat, bit),
            Feature::Incompat(bit) => (self.incompat, bit),
            Feature::RoCompat(bit) => (self.ro_compat, bit),
        }
    }

    #[must_use]
    pub fn has(self, feature: Feature) -> bool {
        let (word, bit) = self.word(feature);
        word & bit != 0
    }

    /// Every set feature by name. Bits without a name are listed as
    /// `compat:0x..`, `incompat:0x..` or `ro_compat:0x..`.
    #[must_use]
    pub fn names(self) -> Vec<String> {
        let mut unnamed = self;
        let mut out = Vec::new();
        for &(feature, name) in FEATURE_NAMES {
            if self.has(feature) {
                out.push(name.to_owned());
                match feature {
                    Feature::Compat(bit) => unnamed.compat &= !bit,
                    Feature::Incompat(bit) => unnamed.incompat &= !bit,
                    Feature::RoCompat(bit) => unnamed.ro_compat &= !bit,
                }
            }
        }
        for (label, bits) in [
            ("compat", unnamed.compat),
            ("incompat", unnamed.incompat),
            ("ro_compat", unnamed.ro_compat),
        ] {
            if bits != 0 {
                out.push(format!("{label}:{bits:#x}"));
            }
        }
        out
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// `s_flags` bit: directory hashes were computed over unsigned name bytes.
pub const EXT2_FLAGS_UNSIGNED_HASH: u32 = 0x0002;

const SB_CHECKSUM_OFFSET: usize = 0x3FC;

/// Decoded view of the 1 KiB superblock.
///
/// Only the fields the read path and the volume summary consume are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub features: Features,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub desc_size: u16,
    pub flags: u32,
    pub checksum: u32,
}

/// Label bytes up to the first NUL, lossily decoded.
fn volume_label(raw: &[u8; 16]) -> String {
    let used = raw.split(|b| *b == 0).next().unwrap_or_default();
    String::from_utf8_lossy(used).trim().to_owned()
}

impl Ext4Superblock {
    /// Decode a superblock from its 1 KiB region (the bytes at volume
    /// offset 1024).
    ///
    /// The magic must be `0xEF53`. Block counts take their high words only
    /// on `64bit` volumes.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        let sb = Fields::new(region, EXT4_SUPERBLOCK_SIZE)?;

        let magic = sb.u16(0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let features = Features {
            compat: sb.u32(0x5C)?,
            incompat: sb.u32(0x60)?,
            ro_compat: sb.u32(0x64)?,
        };
        let wide = |hi: usize| features.has(Feature::BIT64).then_some(hi);

        let rev_level = sb.u32(0x4C)?;
        // Dynamic-revision fields are absent on revision 0.
        let (first_ino, inode_size) = match rev_level {
            0 => (11, 128),
            _ => (sb.u32(0x54)?, sb.u16(0x58)?),
        };

        let seed = sb.sub(0xEC, 16)?;
        Ok(Self {
            inodes_count: sb.u32(0x00)?,
            blocks_count: sb.u32_pair(0x04, wide(0x150))?,
            free_blocks_count: sb.u32_pair(0x0C, wide(0x158))?,
            free_inodes_count: sb.u32(0x10)?,
            first_data_block: sb.u32(0x14)?,
            block_size: BlockSize::from_log(sb.u32(0x18)?)?,
            blocks_per_group: sb.u32(0x20)?,
            inodes_per_group: sb.u32(0x28)?,
            rev_level,
            first_ino,
            inode_size,
            features,
            uuid: sb.array(0x68)?,
            volume_name: volume_label(&sb.array(0x78)?),
            hash_seed: [seed.u32(0)?, seed.u32(4)?, seed.u32(8)?, seed.u32(12)?],
            def_hash_version: sb.u8(0xFC)?,
            desc_size: sb.u16(0xFE)?,
            flags: sb.u32(0x160)?,
            checksum: sb.u32(SB_CHECKSUM_OFFSET)?,
        })
    }

    #[must_use]
    pub fn has_large_file(&self) -> bool {
        self.features.has(Feature::LARGE_FILE)
    }

    #[must_use]
    pub fn has_huge_file(&self) -> bool {
        self.features.has(Feature::HUGE_FILE)
    }

    /// Whether directory hashes on this volume treat name bytes as unsigned.
    #[must_use]
    pub fn uses_unsigned_hash(&self) -> bool {
        (self.flags & EXT2_FLAGS_UNSIGNED_HASH) != 0
    }

    /// Bytes per group descriptor: 32, or `s_desc_size` (at least 64) on
    /// `64bit` volumes.
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.features.has(Feature::BIT64) {
            self.desc_size.max(64)
        } else {
            32
        }
    }

    /// `ceil(blocks_count / blocks_per_group)`; 0 for a zero group size.
    #[must_use]
    pub fn groups_count(&self) -> u64 {
        match self.blocks_per_group {
            0 => 0,
            per_group => self.blocks_count.div_ceil(u64::from(per_group)),
        }
    }

    /// The descriptor table starts in the block after the superblock's.
    #[must_use]
    pub fn group_desc_table_block(&self) -> u64 {
        EXT4_SUPERBLOCK_OFFSET as u64 / u64::from(self.block_size.get()) + 1
    }

    #[must_use]
    pub fn descriptors_per_block(&self) -> u32 {
        self.block_size.get() / u32::from(self.group_desc_size())
    }

    /// Reject geometry that would make group or inode arithmetic meaningless.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let bad = |field, reason| Err(ParseError::InvalidField { field, reason });
        if self.blocks_count == 0 {
            return bad("s_blocks_count", "volume has no blocks");
        }
        if self.blocks_per_group == 0 {
            return bad("s_blocks_per_group", "zero blocks per group");
        }
        if self.inodes_per_group == 0 {
            return bad("s_inodes_per_group", "zero inodes per group");
        }
        let record = u32::from(self.inode_size);
        if record < 128 || !record.is_power_of_two() || record > self.block_size.get() {
            return bad("s_inode_size", "not a power of two between 128 and the block size");
        }
        if self.features.has(Feature::BIT64) && self.desc_size != 0 && !self.desc_size.is_power_of_two() {
            return bad("s_desc_size", "not a power of two");
        }
        if u32::from(self.group_desc_size()) > self.block_size.get() {
            return bad("s_desc_size", "descriptor larger than a block");
        }
        Ok(())
    }

    /// Check `s_checksum` on `metadata_csum` volumes; other volumes pass.
    ///
    /// The CRC32C is seeded with `!0` and covers every byte before the
    /// checksum field.
    pub fn validate_checksum(&self, raw_region: &[u8]) -> Result<(), ParseError> {
        if !self.features.has(Feature::METADATA_CSUM) {
            return Ok(());
        }
        let covered = Fields::new(raw_region, 0)?.bytes(0, SB_CHECKSUM_OFFSET)?;
        if crc32c::crc32c_append(!0, covered) == self.checksum {
            Ok(())
        } else {
            Err(ParseError::InvalidField {
                field: "s_checksum",
                reason: "superblock CRC32C mismatch",
            })
        }
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

/// The parts of a group descriptor the read path and summaries use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
}

impl Ext4GroupDesc {
    /// Decode a `desc_size`-byte descriptor. High words are read only from
    /// descriptors of 64 bytes or more.
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        if desc_size < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptors are at least 32 bytes",
            });
        }
        let gd = Fields::new(bytes, usize::from(desc_size))?;
        let hi = |off: usize| (desc_size >= 64).then_some(off);
        Ok(Self {
            inode_table: gd.u32_pair(0x08, hi(0x28))?,
            free_blocks_count: gd.u16_pair(0x0C, hi(0x2C))?,
            free_inodes_count: gd.u16_pair(0x0E, hi(0x2E))?,
            used_dirs_count: gd.u16_pair(0x10, hi(0x30))?,
        })
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// Size of the `i_block` area in bytes.
pub const I_BLOCK_LEN: usize = EXT4_N_BLOCKS * 4;
const I_BLOCK_OFFSET: usize = 0x28;
const GOOD_OLD_INODE_SIZE: usize = 128;

/// Interpretation of the inode's 60-byte `i_block` area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockMap {
    /// 12 direct pointers followed by single, double and triple indirect.
    ClassicPointers([u32; EXT4_N_BLOCKS]),
    /// Root node of an extent tree, decoded lazily so a damaged tree is
    /// reported when it is walked rather than when the inode is read.
    ExtentTree(ExtentRoot),
    /// Inline data or fast symlink payload; no block mapping exists.
    Inline(#[serde(with = "i_block_bytes")] [u8; I_BLOCK_LEN]),
}

/// Raw root node of an extent tree as stored in `i_block`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRoot(#[serde(with = "i_block_bytes")] pub [u8; I_BLOCK_LEN]);

impl ExtentRoot {
    pub fn parse(&self) -> Result<(ExtentHeader, ExtentNode), ParseError> {
        parse_extent_node(&self.0)
    }
}

mod i_block_bytes {
    use super::I_BLOCK_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; I_BLOCK_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; I_BLOCK_LEN], D::Error> {
        let v: Vec<u8> = Vec::deserialize(d)?;
        v.try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"60 bytes"))
    }
}

/// Coarse file classification from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Regular,
    Other,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::Fifo,
            S_IFREG => Self::Regular,
            _ => Self::Other,
        }
    }
}

/// A decoded on-disk inode record.
///
/// Size and block-count words are kept as stored; combining them depends
/// on volume features, see [`Ext4Inode::size_bytes`] and
/// [`Ext4Inode::blocks_512`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Inode {
    pub mode: u16,
    pub links_count: u16,
    pub flags: u32,
    pub size_lo: u32,
    pub size_high: u32,
    /// `i_blocks_lo` joined with the 16-bit `l_i_blocks_high`.
    pub blocks_raw: u64,
    pub block_map: BlockMap,
}

impl Ext4Inode {
    /// Decode an inode record. Only the 128-byte base layout is read, so
    /// any `s_inode_size` of at least 128 works.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let ino = Fields::new(bytes, GOOD_OLD_INODE_SIZE)?;
        let mode = ino.u16(0x00)?;
        let flags = ino.u32(0x20)?;
        let size_lo = ino.u32(0x04)?;
        let i_block: [u8; I_BLOCK_LEN] = ino.array(I_BLOCK_OFFSET)?;

        let block_map = if flags & EXT4_INLINE_DATA_FL != 0 || is_fast_symlink(mode, flags, size_lo)
        {
            BlockMap::Inline(i_block)
        } else if flags & EXT4_EXTENTS_FL != 0 {
            BlockMap::ExtentTree(ExtentRoot(i_block))
        } else {
            let slots = Fields::new(&i_block, I_BLOCK_LEN)?;
            let mut ptrs = [0_u32; EXT4_N_BLOCKS];
            for (slot, ptr) in ptrs.iter_mut().enumerate() {
                *ptr = slots.u32(slot * 4)?;
            }
            BlockMap::ClassicPointers(ptrs)
        };

        Ok(Self {
            mode,
            links_count: ino.u16(0x1A)?,
            flags,
            size_lo,
            size_high: ino.u32(0x6C)?,
            blocks_raw: ino.u48(0x1C, 0x74)?,
            block_map,
        })
    }

    #[must_use]
    pub fn has_htree_index(&self) -> bool {
        (self.flags & EXT4_INDEX_FL) != 0
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// File size in bytes. `size_high` counts only with `large_file`.
    #[must_use]
    pub fn size_bytes(&self, large_file: bool) -> u64 {
        let high = if large_file { self.size_high } else { 0 };
        (u64::from(high) << 32) | u64::from(self.size_lo)
    }

    /// Allocated space in 512-byte sectors.
    ///
    /// Without `huge_file` only the low 32 bits count. With it the count is
    /// 48 bits, and an inode flagged `HUGE_FILE_FL` counts filesystem blocks.
    #[must_use]
    pub fn blocks_512(&self, huge_file: bool, block_size: BlockSize) -> u64 {
        if !huge_file {
            return self.blocks_raw & u64::from(u32::MAX);
        }
        if self.flags & EXT4_HUGE_FILE_FL != 0 {
            self.blocks_raw.saturating_mul(u64::from(block_size.get() / 512))
        } else {
            self.blocks_raw
        }
    }
}

/// A symlink whose target lives in `i_block` rather than a data block.
fn is_fast_symlink(mode: u16, flags: u32, size_lo: u32) -> bool {
    mode & S_IFMT == S_IFLNK
        && flags & EXT4_EXTENTS_FL == 0
        && usize::try_from(size_lo).is_ok_and(|len| len < I_BLOCK_LEN)
}

// ── Extent tree nodes ───────────────────────────────────────────────────────

/// Extent headers and entries are all 12 bytes.
const EXTENT_RECORD: usize = 12;
/// Lengths above this mark an uninitialized extent.
const EXT_INIT_MAX_LEN: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
}

/// Leaf entry: `[logical_block, logical_block + len)` maps to `physical_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Extent {
    /// Uninitialized extents are allocated but read back as zeros.
    #[must_use]
    pub fn is_uninit(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn len(self) -> u16 {
        if self.is_uninit() {
            self.raw_len - EXT_INIT_MAX_LEN
        } else {
            self.raw_len
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }
}

/// Internal entry: subtree rooted at `child_block` covers logical blocks
/// from `logical_block` up to the next sibling's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub child_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentNode {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIndex>),
}

/// Parse one extent tree node (header plus its `eh_entries` records).
pub fn parse_extent_node(bytes: &[u8]) -> Result<(ExtentHeader, ExtentNode), ParseError> {
    let head = Fields::new(bytes, EXTENT_RECORD)?;
    let magic = head.u16(0)?;
    if magic != EXT4_EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT4_EXTENT_MAGIC),
            actual: u64::from(magic),
        });
    }
    let header = ExtentHeader {
        entries: head.u16(2)?,
        max_entries: head.u16(4)?,
        depth: head.u16(6)?,
    };
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "more entries than eh_max allows",
        });
    }

    let count = usize::from(header.entries);
    let body = head.sub(EXTENT_RECORD, count * EXTENT_RECORD)?;
    let record = |i: usize| body.sub(i * EXTENT_RECORD, EXTENT_RECORD);

    let node = if header.depth == 0 {
        let leaves = (0..count)
            .map(|i| -> Result<Extent, ParseError> {
                let r = record(i)?;
                Ok(Extent {
                    logical_block: r.u32(0)?,
                    raw_len: r.u16(4)?,
                    physical_start: r.u48(8, 6)?,
                })
            })
            .collect::<Result<_, _>>()?;
        ExtentNode::Leaf(leaves)
    } else {
        let indexes = (0..count)
            .map(|i| -> Result<ExtentIndex, ParseError> {
                let r = record(i)?;
                Ok(ExtentIndex {
                    logical_block: r.u32(0)?,
                    child_block: r.u48(4, 8)?,
                })
            })
            .collect::<Result<_, _>>()?;
        ExtentNode::Index(indexes)
    };
    Ok((header, node))
}

// ── Directory entries ───────────────────────────────────────────────────────

/// `file_type` byte of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ext4FileType {
    Unknown,
    RegFile,
    Dir,
    Chrdev,
    Blkdev,
    Fifo,
    Sock,
    Symlink,
}

impl From<u8> for Ext4FileType {
    fn from(raw: u8) -> Self {
        const BY_CODE: [Ext4FileType; 8] = [
            Ext4FileType::Unknown,
            Ext4FileType::RegFile,
            Ext4FileType::Dir,
            Ext4FileType::Chrdev,
            Ext4FileType::Blkdev,
            Ext4FileType::Fifo,
            Ext4FileType::Sock,
            Ext4FileType::Symlink,
        ];
        BY_CODE
            .get(usize::from(raw))
            .copied()
            .unwrap_or(Self::Unknown)
    }
}

/// A live directory entry borrowed from a block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryRef<'a> {
    pub inode: u32,
    pub file_type: Ext4FileType,
    pub name: &'a [u8],
}

impl DirEntryRef<'_> {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }
}

const DIRENT_HEADER: usize = 8;

/// Decode `rec_len`; 64 KiB blocks encode a full-block record as 0 or 65535.
fn rec_len_from_disk(raw: u16, block_size: u32) -> u32 {
    match raw {
        0 | u16::MAX if block_size >= 65_536 => block_size,
        _ if block_size >= 65_536 => {
            let len = u32::from(raw);
            (len & 0xFFFC) | ((len & 0x3) << 16)
        }
        _ => u32::from(raw),
    }
}

/// Iterator over the live entries of one directory block.
///
/// Zero-inode records are not yielded: a deleted entry is stepped over, a
/// record whose `rec_len` reaches the block end terminates the block, and a
/// checksum tail (`file_type == 0xDE`) consumes only its `rec_len`.
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    block_size: u32,
    offset: usize,
    finished: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8], block_size: u32) -> Self {
        Self {
            block,
            block_size,
            offset: 0,
            finished: false,
        }
    }

    /// Decode the record at the cursor and advance past it. `Ok(None)`
    /// means a zero-inode record was consumed.
    fn step(&mut self) -> Result<Option<DirEntryRef<'a>>, ParseError> {
        let rec = Fields::new(self.block, 0)?.sub(self.offset, DIRENT_HEADER)?;
        let inode = rec.u32(0)?;
        let rec_len = rec_len_from_disk(rec.u16(4)?, self.block_size) as usize;
        let name_len = usize::from(rec.u8(6)?);
        let file_type = rec.u8(7)?;

        if rec_len < DIRENT_HEADER {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "shorter than an entry header",
            });
        }
        let end = self
            .offset
            .checked_add(rec_len)
            .filter(|end| *end <= self.block.len())
            .ok_or(ParseError::InvalidField {
                field: "rec_len",
                reason: "record runs past the block",
            })?;

        let start = self.offset;
        self.offset = end;
        if inode == 0 {
            let is_tail = file_type == EXT4_DIR_CSUM_FILE_TYPE && name_len == 0;
            if !is_tail && end >= self.block.len() {
                self.finished = true;
            }
            return Ok(None);
        }
        if DIRENT_HEADER + name_len > rec_len {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name runs past rec_len",
            });
        }
        Ok(Some(DirEntryRef {
            inode,
            file_type: Ext4FileType::from(file_type),
            name: &self.block[start + DIRENT_HEADER..start + DIRENT_HEADER + name_len],
        }))
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished && self.offset + DIRENT_HEADER <= self.block.len() {
            match self.step() {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => {}
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Scan one directory block for `target`, comparing length before bytes.
pub fn find_in_dir_block<'a>(
    block: &'a [u8],
    block_size: u32,
    target: &[u8],
) -> Result<Option<DirEntryRef<'a>>, ParseError> {
    for entry in DirBlockIter::new(block, block_size) {
        let entry = entry?;
        if entry.name.len() == target.len() && entry.name == target {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
