#![forbid(unsafe_code)]
//! Shared vocabulary for the e4 workspace: unit-carrying newtypes, the
//! parse-layer error, a bounds-checked little-endian record reader,
//! inode/group arithmetic and the range binary search used by both the
//! extent and HTree descents.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Byte position of the primary superblock within a volume.
pub const EXT4_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;

/// Slots of `i_block`: 12 direct pointers, then single, double and triple
/// indirect.
pub const EXT4_NDIR_BLOCKS: usize = 12;
pub const EXT4_IND_BLOCK: usize = 12;
pub const EXT4_DIND_BLOCK: usize = 13;
pub const EXT4_TIND_BLOCK: usize = 14;
pub const EXT4_N_BLOCKS: usize = 15;

/// `file_type` byte of the zero-inode record that carries a leaf checksum.
pub const EXT4_DIR_CSUM_FILE_TYPE: u8 = 0xDE;

/// Physical block address on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockNumber(pub u64);

/// 1-based inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupNumber(pub u32);

/// Filesystem block size: a power of two between 1 KiB and 64 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

const MIN_BLOCK_SIZE: u32 = 1024;
const MAX_BLOCK_SIZE: u32 = 64 * 1024;

impl BlockSize {
    pub fn new(bytes: u32) -> Result<Self, ParseError> {
        if bytes.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bytes) {
            Ok(Self(bytes))
        } else {
            Err(ParseError::InvalidField {
                field: "block_size",
                reason: "not a power of two between 1 KiB and 64 KiB",
            })
        }
    }

    /// Decode `s_log_block_size`, which counts doublings above 1 KiB.
    pub fn from_log(log_block_size: u32) -> Result<Self, ParseError> {
        let bytes = log_block_size
            .checked_add(MIN_BLOCK_SIZE.trailing_zeros())
            .and_then(|shift| 1_u32.checked_shl(shift))
            .ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift out of range",
            })?;
        Self::new(bytes)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// 32-bit block pointers held by one classic indirect block.
    #[must_use]
    pub fn pointers_per_block(self) -> u64 {
        u64::from(self.0) / 4
    }

    /// First byte of `block`, `None` if it does not fit in a `u64`.
    #[must_use]
    pub fn block_offset(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = ParseError;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        Self::new(bytes)
    }
}

impl From<BlockSize> for u32 {
    fn from(size: BlockSize) -> Self {
        size.0
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl BlockNumber {
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

macro_rules! display_inner {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        })+
    };
}

display_inner!(BlockNumber, InodeNumber, GroupNumber, BlockSize);

/// Failure to decode an on-disk structure from bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("record truncated: {needed} bytes wanted at offset {offset}, {actual} available")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("bad magic {actual:#x} (want {expected:#x})")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("{field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} does not fit in the address space")]
    IntegerConversion { field: &'static str },
}

/// Bounds-checked little-endian field access over one on-disk record.
///
/// Offsets are relative to the start of the record. Every accessor fails
/// with [`ParseError::InsufficientData`] instead of panicking when the
/// record is short.
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    raw: &'a [u8],
}

impl<'a> Fields<'a> {
    /// View `raw` as a record that must be at least `min_len` bytes long.
    pub fn new(raw: &'a [u8], min_len: usize) -> Result<Self, ParseError> {
        if raw.len() < min_len {
            return Err(ParseError::InsufficientData {
                needed: min_len,
                offset: 0,
                actual: raw.len(),
            });
        }
        Ok(Self { raw })
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.raw.is_empty()
    }

    /// `len` bytes starting at `offset`.
    pub fn bytes(self, offset: usize, len: usize) -> Result<&'a [u8], ParseError> {
        offset
            .checked_add(len)
            .and_then(|end| self.raw.get(offset..end))
            .ok_or(ParseError::InsufficientData {
                needed: len,
                offset,
                actual: self.raw.len().saturating_sub(offset),
            })
    }

    /// Sub-record of `len` bytes at `offset`, with offsets rebased to it.
    pub fn sub(self, offset: usize, len: usize) -> Result<Self, ParseError> {
        self.bytes(offset, len).map(|raw| Self { raw })
    }

    pub fn array<const N: usize>(self, offset: usize) -> Result<[u8; N], ParseError> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.bytes(offset, N)?);
        Ok(out)
    }

    pub fn u8(self, offset: usize) -> Result<u8, ParseError> {
        self.array::<1>(offset).map(|[b]| b)
    }

    pub fn u16(self, offset: usize) -> Result<u16, ParseError> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub fn u32(self, offset: usize) -> Result<u32, ParseError> {
        self.array(offset).map(u32::from_le_bytes)
    }

    /// A 32-bit low word, widened by a 32-bit high word when `hi` is given.
    ///
    /// ext4 stores most 64-bit quantities this way and only consults the
    /// high half when a feature (64bit, large descriptors) enables it.
    pub fn u32_pair(self, lo: usize, hi: Option<usize>) -> Result<u64, ParseError> {
        let low = u64::from(self.u32(lo)?);
        match hi {
            Some(hi) => Ok(low | (u64::from(self.u32(hi)?) << 32)),
            None => Ok(low),
        }
    }

    /// A 16-bit low word, widened by a 16-bit high word when `hi` is given.
    pub fn u16_pair(self, lo: usize, hi: Option<usize>) -> Result<u32, ParseError> {
        let low = u32::from(self.u16(lo)?);
        match hi {
            Some(hi) => Ok(low | (u32::from(self.u16(hi)?) << 16)),
            None => Ok(low),
        }
    }

    /// A 48-bit value: 32-bit low word plus 16-bit high word.
    pub fn u48(self, lo: usize, hi: usize) -> Result<u64, ParseError> {
        Ok(u64::from(self.u32(lo)?) | (u64::from(self.u16(hi)?) << 32))
    }
}

// Mode bits (`i_mode & S_IFMT`).
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFIFO: u16 = 0o010_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;

// Inode flags (`i_flags`) that change how the inode is read.
pub const EXT4_INDEX_FL: u32 = 0x0000_1000;
/// `i_blocks` counts filesystem blocks rather than 512-byte sectors.
pub const EXT4_HUGE_FILE_FL: u32 = 0x0004_0000;
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

/// Narrow a disk-derived `u64` to `usize`.
pub fn to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Group holding inode `ino`. Inode numbers start at 1.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    let group = ino.0.saturating_sub(1) / u64::from(inodes_per_group);
    GroupNumber(u32::try_from(group).unwrap_or(u32::MAX))
}

/// Slot of inode `ino` inside its group's inode table.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // remainder of a u32 divisor
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    (ino.0.saturating_sub(1) % u64::from(inodes_per_group)) as u32
}

/// Binary search over sorted entries that each own a key range.
///
/// `cmp(entry, next)` reports where the target sits relative to the range
/// owned by `entry`: `Less` if it precedes the range, `Equal` if inside,
/// `Greater` if after. `next` is `None` for the final entry so policies can
/// leave the last range open-ended.
pub fn search_by_range<T, F>(items: &[T], mut cmp: F) -> Option<usize>
where
    F: FnMut(&T, Option<&T>) -> Ordering,
{
    let mut lo = 0_usize;
    let mut hi = items.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(&items[mid], items.get(mid + 1)) {
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}

/// Half-open policy: the entry owns `[start, start + len)`.
#[must_use]
pub fn half_open_range(target: u64, start: u64, len: u64) -> Ordering {
    if target < start {
        Ordering::Less
    } else if target - start >= len {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Until-next policy: the entry owns `[start, next_start)`, or `[start, ∞)`
/// when it is the last entry.
#[must_use]
pub fn until_next_range(target: u64, start: u64, next_start: Option<u64>) -> Ordering {
    if target < start {
        return Ordering::Less;
    }
    match next_start {
        Some(next) if target >= next => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RECORD: [u8; 10] = [0x34, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90, 0x02, 0x00];

    #[test]
    fn fields_decode_little_endian() {
        let rec = Fields::new(&RECORD, 8).unwrap();
        assert_eq!(rec.u8(1).unwrap(), 0x12);
        assert_eq!(rec.u16(0).unwrap(), 0x1234);
        assert_eq!(rec.u32(4).unwrap(), 0x90AB_CDEF);
        assert_eq!(rec.array::<2>(8).unwrap(), [0x02, 0x00]);
        assert_eq!(rec.sub(4, 4).unwrap().u16(2).unwrap(), 0x90AB);
    }

    #[test]
    fn fields_join_split_words() {
        let rec = Fields::new(&RECORD, 0).unwrap();
        assert_eq!(rec.u32_pair(0, None).unwrap(), 0x5678_1234);
        assert_eq!(rec.u32_pair(0, Some(4)).unwrap(), 0x90AB_CDEF_5678_1234);
        assert_eq!(rec.u16_pair(0, Some(8)).unwrap(), 0x0002_1234);
        assert_eq!(rec.u48(4, 8).unwrap(), 0x0002_90AB_CDEF);
    }

    #[test]
    fn short_records_are_reported() {
        assert_eq!(
            Fields::new(&RECORD, 16).unwrap_err(),
            ParseError::InsufficientData {
                needed: 16,
                offset: 0,
                actual: 10
            }
        );
        let rec = Fields::new(&RECORD, 0).unwrap();
        assert_eq!(
            rec.u32(8).unwrap_err(),
            ParseError::InsufficientData {
                needed: 4,
                offset: 8,
                actual: 2
            }
        );
        assert!(rec.bytes(usize::MAX, 2).is_err());
        assert!(rec.u32_pair(0, Some(9)).is_err());
    }

    #[test]
    fn block_size_bounds() {
        assert_eq!(BlockSize::from_log(0).unwrap().get(), 1024);
        assert_eq!(BlockSize::from_log(2).unwrap().get(), 4096);
        assert_eq!(BlockSize::from_log(6).unwrap().get(), 65_536);
        assert!(BlockSize::from_log(7).is_err());
        assert!(BlockSize::from_log(40).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert_eq!(BlockSize::new(1024).unwrap().pointers_per_block(), 256);
    }

    #[test]
    fn block_offsets_overflow_to_none() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.block_offset(BlockNumber(100)), Some(409_600));
        assert_eq!(bs.block_offset(BlockNumber(u64::MAX)), None);
        assert_eq!(BlockNumber(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn block_size_serde_validates() {
        let bs: BlockSize = serde_json::from_str("4096").unwrap();
        assert_eq!(bs.get(), 4096);
        assert!(serde_json::from_str::<BlockSize>("4000").is_err());
        assert_eq!(serde_json::to_string(&InodeNumber(11)).unwrap(), "11");
    }

    #[test]
    fn inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2048), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2049), 2048), GroupNumber(1));
        assert_eq!(inode_index_in_group(InodeNumber(2), 2048), 1);
        assert_eq!(inode_index_in_group(InodeNumber(2049), 2048), 0);
        assert_eq!(inode_to_group(InodeNumber(u64::MAX), 1), GroupNumber(u32::MAX));
    }

    #[test]
    fn half_open_boundaries() {
        assert_eq!(half_open_range(3, 4, 4), Ordering::Less);
        assert_eq!(half_open_range(4, 4, 4), Ordering::Equal);
        assert_eq!(half_open_range(7, 4, 4), Ordering::Equal);
        assert_eq!(half_open_range(8, 4, 4), Ordering::Greater);
    }

    #[test]
    fn until_next_last_entry_is_open_ended() {
        assert_eq!(until_next_range(9, 10, Some(20)), Ordering::Less);
        assert_eq!(until_next_range(19, 10, Some(20)), Ordering::Equal);
        assert_eq!(until_next_range(20, 10, Some(20)), Ordering::Greater);
        assert_eq!(until_next_range(u64::MAX, 10, None), Ordering::Equal);
    }

    #[test]
    fn search_half_open_leaves_holes_unmatched() {
        let ranges = [(0_u64, 4_u64), (4, 4), (10, 2)];
        let find = |target: u64| {
            search_by_range(&ranges, |&(start, len), _| {
                half_open_range(target, start, len)
            })
        };
        assert_eq!(find(5), Some(1));
        assert_eq!(find(11), Some(2));
        assert_eq!(find(8), None);
        assert_eq!(find(12), None);
    }

    #[test]
    fn search_until_next_picks_covering_entry() {
        let starts = [0_u64, 100, 200];
        let find = |target: u64| {
            search_by_range(&starts, |start, next| {
                until_next_range(target, *start, next.copied())
            })
        };
        assert_eq!(find(0), Some(0));
        assert_eq!(find(99), Some(0));
        assert_eq!(find(100), Some(1));
        assert_eq!(find(1_000_000), Some(2));
    }

    #[test]
    fn search_empty_slice() {
        let empty: [u64; 0] = [];
        assert_eq!(search_by_range(&empty, |_, _| Ordering::Equal), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn inode_index_always_within_group(ino in 1_u64..=u64::from(u32::MAX), ipg in 1_u32..=65_536) {
            let ino = InodeNumber(ino);
            let group = inode_to_group(ino, ipg);
            let idx = inode_index_in_group(ino, ipg);
            prop_assert!(idx < ipg);
            prop_assert_eq!(u64::from(group.0) * u64::from(ipg) + u64::from(idx) + 1, ino.0);
        }

        #[test]
        fn until_next_search_matches_linear_scan(
            mut starts in proptest::collection::vec(0_u64..10_000, 1..32),
            target in 0_u64..12_000,
        ) {
            starts.sort_unstable();
            starts.dedup();
            let expected = starts.iter().rposition(|s| *s <= target);
            let found = search_by_range(&starts, |start, next| {
                until_next_range(target, *start, next.copied())
            });
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn block_size_group_count_matches_ceiling(
            log in 0_u32..=6,
            blocks in 1_u64..=u64::from(u32::MAX),
            per_group in 1_u32..=65_536,
        ) {
            let bs = BlockSize::from_log(log).unwrap();
            prop_assert_eq!(bs.get(), 1024 << log);
            let groups = blocks.div_ceil(u64::from(per_group));
            prop_assert!(groups * u64::from(per_group) >= blocks);
            prop_assert!((groups - 1) * u64::from(per_group) < blocks);
        }
    }
}
