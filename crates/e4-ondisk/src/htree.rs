#![forbid(unsafe_code)]
//! Hash-indexed directory (htree/DX) structures and name hashes.
//!
//! A DX directory keeps its index in ordinary directory blocks disguised as
//! empty entries. Block 0 is the root: fake `.` and `..` records, an
//! 8-byte info header, then a count/limit pair occupying the hash slot of
//! the first index entry. Interior blocks carry one fake record spanning
//! the whole block followed by the same count/limit + entry layout.
//!
//! The hash of a name is a pure function of the name bytes, the volume's
//! 128-bit seed and the hash version recorded in the root.

use e4_types::{Fields, ParseError};
use serde::{Deserialize, Serialize};

/// Offset of the count/limit pair in the root block.
const DX_ROOT_COUNT_LIMIT: usize = 0x20;
/// Offset of the count/limit pair in an interior node block.
const DX_NODE_COUNT_LIMIT: usize = 0x08;
const DX_ENTRY_SIZE: usize = 8;
/// High nibble of an index entry's block word is reserved.
const DX_BLOCK_MASK: u32 = 0x0FFF_FFFF;

/// Reserved end-of-directory hash for 32-bit readdir cookies.
const EXT4_HTREE_EOF_32BIT: u32 = 0x7FFF_FFFF;

/// One index entry: names hashing to `[hash, next.hash)` live under `block`.
///
/// `block` is a logical block number within the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxEntry {
    pub hash: u32,
    pub block: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxRoot {
    pub hash_version: u8,
    pub info_length: u8,
    pub indirect_levels: u8,
    pub limit: u16,
    /// Sorted by hash. The first entry's hash slot holds count/limit on
    /// disk and is reported as 0.
    pub entries: Vec<DxEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxNode {
    pub limit: u16,
    pub entries: Vec<DxEntry>,
}

/// Parse the DX root from block 0 of a hash-indexed directory.
pub fn parse_dx_root(block: &[u8]) -> Result<DxRoot, ParseError> {
    let root = Fields::new(block, DX_ROOT_COUNT_LIMIT + DX_ENTRY_SIZE)?;
    let [hash_version, info_length, indirect_levels] = root.array(0x1C)?;

    if info_length != 8 {
        return Err(ParseError::InvalidField {
            field: "dx_root_info_length",
            reason: "expected 8",
        });
    }

    let (limit, entries) = parse_dx_entries(root, DX_ROOT_COUNT_LIMIT)?;
    Ok(DxRoot {
        hash_version,
        info_length,
        indirect_levels,
        limit,
        entries,
    })
}

/// Parse an interior DX node block.
pub fn parse_dx_node(block: &[u8]) -> Result<DxNode, ParseError> {
    let (limit, entries) = parse_dx_entries(Fields::new(block, 0)?, DX_NODE_COUNT_LIMIT)?;
    Ok(DxNode { limit, entries })
}

fn parse_dx_entries(block: Fields<'_>, start: usize) -> Result<(u16, Vec<DxEntry>), ParseError> {
    let limit = block.u16(start)?;
    let count = block.u16(start + 2)?;
    if count == 0 {
        return Err(ParseError::InvalidField {
            field: "dx_count",
            reason: "index node has no entries",
        });
    }
    if count > limit {
        return Err(ParseError::InvalidField {
            field: "dx_count",
            reason: "count exceeds limit",
        });
    }
    let table = block.sub(start, usize::from(count) * DX_ENTRY_SIZE)?;

    // Slot 0 carries count/limit where its hash would be.
    let entries = (0..usize::from(count))
        .map(|idx| -> Result<DxEntry, ParseError> {
            let off = idx * DX_ENTRY_SIZE;
            Ok(DxEntry {
                hash: if idx == 0 { 0 } else { table.u32(off)? },
                block: table.u32(off + 4)? & DX_BLOCK_MASK,
            })
        })
        .collect::<Result<_, _>>()?;
    Ok((limit, entries))
}

// ── Name hashes ─────────────────────────────────────────────────────────────

/// Directory hash families as numbered in the DX root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DxHashVersion {
    Legacy,
    HalfMd4,
    Tea,
    LegacyUnsigned,
    HalfMd4Unsigned,
    TeaUnsigned,
}

impl DxHashVersion {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Legacy),
            1 => Some(Self::HalfMd4),
            2 => Some(Self::Tea),
            3 => Some(Self::LegacyUnsigned),
            4 => Some(Self::HalfMd4Unsigned),
            5 => Some(Self::TeaUnsigned),
            _ => None,
        }
    }

    /// Version to hash with: a signed family recorded in the root switches
    /// to its unsigned twin when the volume was created with unsigned chars.
    #[must_use]
    pub fn effective(raw: u8, unsigned_volume: bool) -> Option<Self> {
        let version = Self::from_raw(raw)?;
        if !unsigned_volume {
            return Some(version);
        }
        Some(match version {
            Self::Legacy => Self::LegacyUnsigned,
            Self::HalfMd4 => Self::HalfMd4Unsigned,
            Self::Tea => Self::TeaUnsigned,
            other => other,
        })
    }

    fn is_signed(self) -> bool {
        matches!(self, Self::Legacy | Self::HalfMd4 | Self::Tea)
    }
}

/// `(major, minor)` hash pair; `major` orders the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DxHash {
    pub major: u32,
    pub minor: u32,
}

const DEFAULT_SEED: [u32; 4] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476];

/// Hash `name` the way the directory index was built.
///
/// An all-zero `seed` falls back to the MD4 initial constants.
#[must_use]
pub fn dx_hash(version: DxHashVersion, name: &[u8], seed: &[u32; 4]) -> DxHash {
    let mut buf = if seed.iter().any(|w| *w != 0) {
        *seed
    } else {
        DEFAULT_SEED
    };
    let signed = version.is_signed();

    let (major, minor) = match version {
        DxHashVersion::Legacy | DxHashVersion::LegacyUnsigned => {
            (dx_hack_hash(name, signed), 0)
        }
        DxHashVersion::HalfMd4 | DxHashVersion::HalfMd4Unsigned => {
            for chunk_start in (0..name.len()).step_by(32) {
                let input = str2hashbuf::<8>(&name[chunk_start..], signed);
                half_md4_transform(&mut buf, &input);
            }
            (buf[1], buf[2])
        }
        DxHashVersion::Tea | DxHashVersion::TeaUnsigned => {
            for chunk_start in (0..name.len()).step_by(16) {
                let input = str2hashbuf::<4>(&name[chunk_start..], signed);
                tea_transform(&mut buf, &input);
            }
            (buf[0], buf[1])
        }
    };

    DxHash {
        major: normalize_major(major),
        minor,
    }
}

/// Clear the collision bit and keep clear of the 32-bit EOF cookie.
#[must_use]
pub fn normalize_major(hash: u32) -> u32 {
    let hash = hash & !1;
    if hash == EXT4_HTREE_EOF_32BIT << 1 {
        (EXT4_HTREE_EOF_32BIT - 1) << 1
    } else {
        hash
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn name_byte(b: u8, signed: bool) -> u32 {
    if signed {
        i32::from(b as i8) as u32
    } else {
        u32::from(b)
    }
}

fn dx_hack_hash(name: &[u8], signed: bool) -> u32 {
    let mut hash0: u32 = 0x12a3_fe2d;
    let mut hash1: u32 = 0x37ab_e8f9;
    for &b in name {
        let c = name_byte(b, signed);
        let mut hash = hash1.wrapping_add(hash0 ^ c.wrapping_mul(7_152_373));
        if hash & 0x8000_0000 != 0 {
            hash = hash.wrapping_sub(0x7fff_ffff);
        }
        hash1 = hash0;
        hash0 = hash;
    }
    hash0 << 1
}

/// Pack up to `N * 4` bytes of `msg` into words, padding with a pattern
/// built from the remaining message length.
#[allow(clippy::cast_possible_truncation)] // names are at most 255 bytes
fn str2hashbuf<const N: usize>(msg: &[u8], signed: bool) -> [u32; N] {
    let len = msg.len() as u32;
    let mut pad = len | (len << 8);
    pad |= pad << 16;

    let mut out = [pad; N];
    let mut val = pad;
    let mut filled = 0;
    for (i, &b) in msg.iter().take(N * 4).enumerate() {
        val = name_byte(b, signed).wrapping_add(val << 8);
        if i % 4 == 3 {
            out[filled] = val;
            filled += 1;
            val = pad;
        }
    }
    if filled < N {
        out[filled] = val;
    }
    out
}

const K2: u32 = 0x5A82_7999;
const K3: u32 = 0x6ED9_EBA1;

#[inline]
fn md4_f(x: u32, y: u32, z: u32) -> u32 {
    z ^ (x & (y ^ z))
}

#[inline]
fn md4_g(x: u32, y: u32, z: u32) -> u32 {
    (x & y).wrapping_add((x ^ y) & z)
}

#[inline]
fn md4_h(x: u32, y: u32, z: u32) -> u32 {
    x ^ y ^ z
}

#[inline]
fn step(a: u32, f: u32, x: u32, s: u32) -> u32 {
    a.wrapping_add(f).wrapping_add(x).rotate_left(s)
}

/// Three reduced MD4 rounds over one 32-byte block.
fn half_md4_transform(buf: &mut [u32; 4], input: &[u32; 8]) {
    let [mut a, mut b, mut c, mut d] = *buf;
    let x = |i: usize, k: u32| input[i].wrapping_add(k);

    a = step(a, md4_f(b, c, d), x(0, 0), 3);
    d = step(d, md4_f(a, b, c), x(1, 0), 7);
    c = step(c, md4_f(d, a, b), x(2, 0), 11);
    b = step(b, md4_f(c, d, a), x(3, 0), 19);
    a = step(a, md4_f(b, c, d), x(4, 0), 3);
    d = step(d, md4_f(a, b, c), x(5, 0), 7);
    c = step(c, md4_f(d, a, b), x(6, 0), 11);
    b = step(b, md4_f(c, d, a), x(7, 0), 19);

    a = step(a, md4_g(b, c, d), x(1, K2), 3);
    d = step(d, md4_g(a, b, c), x(3, K2), 5);
    c = step(c, md4_g(d, a, b), x(5, K2), 9);
    b = step(b, md4_g(c, d, a), x(7, K2), 13);
    a = step(a, md4_g(b, c, d), x(0, K2), 3);
    d = step(d, md4_g(a, b, c), x(2, K2), 5);
    c = step(c, md4_g(d, a, b), x(4, K2), 9);
    b = step(b, md4_g(c, d, a), x(6, K2), 13);

    a = step(a, md4_h(b, c, d), x(3, K3), 3);
    d = step(d, md4_h(a, b, c), x(7, K3), 9);
    c = step(c, md4_h(d, a, b), x(2, K3), 11);
    b = step(b, md4_h(c, d, a), x(6, K3), 15);
    a = step(a, md4_h(b, c, d), x(1, K3), 3);
    d = step(d, md4_h(a, b, c), x(5, K3), 9);
    c = step(c, md4_h(d, a, b), x(0, K3), 11);
    b = step(b, md4_h(c, d, a), x(4, K3), 15);

    buf[0] = buf[0].wrapping_add(a);
    buf[1] = buf[1].wrapping_add(b);
    buf[2] = buf[2].wrapping_add(c);
    buf[3] = buf[3].wrapping_add(d);
}

const TEA_DELTA: u32 = 0x9E37_79B9;

/// Sixteen TEA Feistel rounds keyed by one 16-byte block.
fn tea_transform(buf: &mut [u32; 4], input: &[u32; 4]) {
    let [a, b, c, d] = *input;
    let mut sum: u32 = 0;
    let mut b0 = buf[0];
    let mut b1 = buf[1];
    for _ in 0..16 {
        sum = sum.wrapping_add(TEA_DELTA);
        b0 = b0.wrapping_add(
            (b1 << 4).wrapping_add(a) ^ b1.wrapping_add(sum) ^ (b1 >> 5).wrapping_add(b),
        );
        b1 = b1.wrapping_add(
            (b0 << 4).wrapping_add(c) ^ b0.wrapping_add(sum) ^ (b0 >> 5).wrapping_add(d),
        );
    }
    buf[0] = buf[0].wrapping_add(b0);
    buf[1] = buf[1].wrapping_add(b1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NO_SEED: [u32; 4] = [0; 4];
    const LONG_NAME: &[u8] = b"a-name-that-is-longer-than-thirty-two-bytes";

    fn h(version: DxHashVersion, name: &[u8]) -> (u32, u32) {
        let out = dx_hash(version, name, &NO_SEED);
        (out.major, out.minor)
    }

    #[test]
    fn legacy_reference_values() {
        assert_eq!(h(DxHashVersion::Legacy, b"file.txt"), (0x7868_4c1e, 0));
        assert_eq!(h(DxHashVersion::Legacy, b"lost+found"), (0x5e2a_ba24, 0));
        assert_eq!(h(DxHashVersion::Legacy, LONG_NAME), (0xa124_a784, 0));
    }

    #[test]
    fn half_md4_reference_values() {
        assert_eq!(
            h(DxHashVersion::HalfMd4, b"file.txt"),
            (0x64fb_e4fe, 0xe0e0_d3e8)
        );
        assert_eq!(
            h(DxHashVersion::HalfMd4, b"lost+found"),
            (0x591d_e422, 0x6ffc_56e0)
        );
        assert_eq!(
            h(DxHashVersion::HalfMd4, LONG_NAME),
            (0xd3e5_6b26, 0xbe16_174e)
        );
    }

    #[test]
    fn tea_reference_values() {
        assert_eq!(h(DxHashVersion::Tea, b"file.txt"), (0x572a_0842, 0x3317_d5e2));
        assert_eq!(
            h(DxHashVersion::Tea, b"lost+found"),
            (0x2dbf_9e80, 0xbfeb_ee4f)
        );
        assert_eq!(h(DxHashVersion::Tea, LONG_NAME), (0x1c92_60d6, 0xd026_455a));
    }

    #[test]
    fn signedness_only_matters_for_high_bytes() {
        let ascii = b"file.txt";
        assert_eq!(
            h(DxHashVersion::HalfMd4, ascii),
            h(DxHashVersion::HalfMd4Unsigned, ascii)
        );
        let latin1 = b"caf\xe9";
        assert_eq!(h(DxHashVersion::Legacy, latin1), (0x65f2_3bce, 0));
        assert_eq!(h(DxHashVersion::LegacyUnsigned, latin1), (0x7c38_49d0, 0));
        assert_eq!(
            h(DxHashVersion::HalfMd4, latin1),
            (0x9be4_a372, 0xc33d_4f19)
        );
        assert_eq!(
            h(DxHashVersion::HalfMd4Unsigned, latin1),
            (0xab40_8964, 0x0789_3b5c)
        );
        assert_eq!(h(DxHashVersion::Tea, latin1), (0x84b3_a194, 0x1cf7_1779));
        assert_eq!(
            h(DxHashVersion::TeaUnsigned, latin1),
            (0xe665_cc26, 0x417d_943d)
        );
    }

    #[test]
    fn seed_replaces_default_constants() {
        let seeded = dx_hash(DxHashVersion::HalfMd4, b"file.txt", &[1, 2, 3, 4]);
        assert_eq!((seeded.major, seeded.minor), (0x47d4_891e, 0x6a2e_c60a));
        assert_ne!(seeded, dx_hash(DxHashVersion::HalfMd4, b"file.txt", &NO_SEED));
    }

    #[test]
    fn families_disagree_on_same_name() {
        let legacy = h(DxHashVersion::Legacy, b"file.txt").0;
        let md4 = h(DxHashVersion::HalfMd4, b"file.txt").0;
        let tea = h(DxHashVersion::Tea, b"file.txt").0;
        assert_ne!(legacy, md4);
        assert_ne!(md4, tea);
        assert_ne!(legacy, tea);
    }

    #[test]
    fn empty_name_hashes_to_seed_words() {
        let md4 = dx_hash(DxHashVersion::HalfMd4, b"", &NO_SEED);
        assert_eq!(md4.major, DEFAULT_SEED[1] & !1);
        assert_eq!(md4.minor, DEFAULT_SEED[2]);
    }

    #[test]
    fn normalization_clears_low_bit_and_eof_cookie() {
        assert_eq!(normalize_major(5), 4);
        assert_eq!(normalize_major(0xFFFF_FFFF), 0xFFFF_FFFC);
        assert_eq!(normalize_major(0xFFFF_FFFE), 0xFFFF_FFFC);
        assert_eq!(normalize_major(0xFFFF_FFFD), 0xFFFF_FFFC);
        assert_eq!(normalize_major(0x8000_0000), 0x8000_0000);
    }

    #[test]
    fn effective_version_follows_volume_signedness() {
        assert_eq!(
            DxHashVersion::effective(1, true),
            Some(DxHashVersion::HalfMd4Unsigned)
        );
        assert_eq!(DxHashVersion::effective(2, false), Some(DxHashVersion::Tea));
        assert_eq!(
            DxHashVersion::effective(5, false),
            Some(DxHashVersion::TeaUnsigned)
        );
        assert_eq!(DxHashVersion::effective(6, false), None);
    }

    #[test]
    fn str2hashbuf_padding() {
        // "ab" has remaining length 2: pad byte 0x02 in every lane.
        let words = str2hashbuf::<4>(b"ab", false);
        assert_eq!(words[0], 0x0202_6162);
        assert_eq!(&words[1..], &[0x0202_0202; 3]);
        let words = str2hashbuf::<4>(b"abcd", false);
        assert_eq!(words[0], 0x6162_6364);
        assert_eq!(words[1], 0x0404_0404);
    }

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn parse_root_with_three_entries() {
        let mut block = vec![0_u8; 1024];
        block[0x1C] = 1;
        block[0x1D] = 8;
        block[0x1E] = 0;
        put_u16(&mut block, 0x20, 123);
        put_u16(&mut block, 0x22, 3);
        put_u32(&mut block, 0x24, 1);
        put_u32(&mut block, 0x28, 0x4000_0000);
        put_u32(&mut block, 0x2C, 2);
        put_u32(&mut block, 0x30, 0x8000_0000);
        put_u32(&mut block, 0x34, 0xF000_0003);

        let root = parse_dx_root(&block).unwrap();
        assert_eq!(root.hash_version, 1);
        assert_eq!(root.limit, 123);
        assert_eq!(
            root.entries,
            vec![
                DxEntry { hash: 0, block: 1 },
                DxEntry {
                    hash: 0x4000_0000,
                    block: 2
                },
                DxEntry {
                    hash: 0x8000_0000,
                    block: 3
                },
            ]
        );
    }

    #[test]
    fn parse_root_rejects_bad_info_and_counts() {
        let mut block = vec![0_u8; 1024];
        block[0x1D] = 4;
        put_u16(&mut block, 0x20, 10);
        put_u16(&mut block, 0x22, 1);
        assert!(parse_dx_root(&block).is_err());

        block[0x1D] = 8;
        put_u16(&mut block, 0x22, 11);
        assert!(parse_dx_root(&block).is_err());

        put_u16(&mut block, 0x22, 0);
        assert!(parse_dx_root(&block).is_err());
    }

    #[test]
    fn parse_interior_node() {
        let mut block = vec![0_u8; 1024];
        put_u32(&mut block, 0, 0);
        put_u16(&mut block, 4, 1024);
        put_u16(&mut block, 0x08, 127);
        put_u16(&mut block, 0x0A, 2);
        put_u32(&mut block, 0x0C, 5);
        put_u32(&mut block, 0x10, 0x1234_5678);
        put_u32(&mut block, 0x14, 6);
        let node = parse_dx_node(&block).unwrap();
        assert_eq!(node.limit, 127);
        assert_eq!(node.entries[0], DxEntry { hash: 0, block: 5 });
        assert_eq!(
            node.entries[1],
            DxEntry {
                hash: 0x1234_5678,
                block: 6
            }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn hash_is_pure_and_normalized(
            name in proptest::collection::vec(any::<u8>(), 1..=255),
            seed in any::<[u32; 4]>(),
            raw_version in 0_u8..6,
        ) {
            let version = DxHashVersion::from_raw(raw_version).unwrap();
            let first = dx_hash(version, &name, &seed);
            let second = dx_hash(version, &name, &seed);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first.major & 1, 0);
            prop_assert_ne!(first.major, 0xFFFF_FFFE);
        }
    }
}
