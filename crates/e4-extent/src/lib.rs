#![forbid(unsafe_code)]
//! Block address resolution: logical file block to backing buffer.
//!
//! Two mapping schemes are supported, selected by the inode's
//! [`BlockMap`]:
//!
//! - **Extent tree**: binary search per level. Leaves own half-open ranges
//!   `[logical, logical + len)`; index entries own everything up to the
//!   next sibling's start. Unmapped and uninitialized ranges read as zeros.
//! - **Classic pointers**: 12 direct slots followed by single, double and
//!   triple indirect chains. A zero pointer is fetched like any other block
//!   number; the scheme has no hole handling of its own.
//!
//! Every descent acquires the child buffer before the parent's guard is
//! dropped, so no block referenced further up the walk can be evicted
//! while it is still being decoded.

use e4_block::{BlockGuard, BufferCache};
use e4_error::{Ext4Error, Result};
use e4_ondisk::{BlockMap, Ext4Inode, ExtentNode, ExtentRoot, parse_extent_node};
use e4_types::{
    BlockNumber, EXT4_DIND_BLOCK, EXT4_IND_BLOCK, EXT4_NDIR_BLOCKS, EXT4_TIND_BLOCK, InodeNumber,
    Fields, half_open_range, search_by_range, until_next_range,
};
use tracing::{trace, warn};

/// Maximum extent tree depth (ext4 kernel limit).
const MAX_EXTENT_DEPTH: u16 = 5;

/// Where a logical block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Backed by this physical block.
    Mapped(BlockNumber),
    /// Allocated but never written; reads as zeros.
    Unwritten(BlockNumber),
    /// No extent covers the block.
    Hole,
}

fn tree_corrupt(ino: InodeNumber, detail: impl Into<String>) -> Ext4Error {
    let detail = detail.into();
    warn!(ino = ino.0, %detail, "extent tree corrupt");
    Ext4Error::ExtentTreeCorrupt { ino: ino.0, detail }
}

/// Resolve `logical` of `inode` to a buffer holding that block's bytes.
///
/// Holes and uninitialized extents yield a transient zero-filled buffer of
/// one block. `pin` applies to the returned data block only; index and
/// pointer blocks visited on the way are always pinned while in use.
pub fn resolve<'c>(
    cache: &'c dyn BufferCache,
    ino: InodeNumber,
    inode: &Ext4Inode,
    logical: u64,
    pin: bool,
) -> Result<BlockGuard<'c>> {
    let (mapping, path_guard) = locate(cache, ino, inode, logical)?;
    let data = match mapping {
        Mapping::Mapped(block) => cache.request_block(block, pin)?,
        Mapping::Unwritten(_) | Mapping::Hole => BlockGuard::zeroed(cache.block_size()),
    };
    drop(path_guard);
    Ok(data)
}

/// Map `logical` without fetching the data block.
pub fn map_block(
    cache: &dyn BufferCache,
    ino: InodeNumber,
    inode: &Ext4Inode,
    logical: u64,
) -> Result<Mapping> {
    locate(cache, ino, inode, logical).map(|(mapping, _)| mapping)
}

/// Walk the block map and return the mapping together with the guard on
/// the last metadata block visited, which the caller releases once it
/// holds the data block.
fn locate<'c>(
    cache: &'c dyn BufferCache,
    ino: InodeNumber,
    inode: &Ext4Inode,
    logical: u64,
) -> Result<(Mapping, Option<BlockGuard<'c>>)> {
    match &inode.block_map {
        BlockMap::ExtentTree(root) => locate_extent(cache, ino, root, logical),
        BlockMap::ClassicPointers(ptrs) => locate_classic(cache, ino, ptrs, logical)
            .map(|(block, guard)| (Mapping::Mapped(block), guard)),
        BlockMap::Inline(_) => Err(Ext4Error::UnsupportedFeature(format!(
            "inode {ino} keeps its data inline and has no block mapping"
        ))),
    }
}

fn locate_extent<'c>(
    cache: &'c dyn BufferCache,
    ino: InodeNumber,
    root: &ExtentRoot,
    logical: u64,
) -> Result<(Mapping, Option<BlockGuard<'c>>)> {
    let (mut header, mut node) = root
        .parse()
        .map_err(|e| tree_corrupt(ino, format!("root node: {e}")))?;
    if header.depth > MAX_EXTENT_DEPTH {
        return Err(tree_corrupt(
            ino,
            format!("depth {} exceeds maximum {MAX_EXTENT_DEPTH}", header.depth),
        ));
    }

    // Extents address 32-bit logical blocks; anything beyond is unmapped.
    let Ok(target) = u32::try_from(logical) else {
        return Ok((Mapping::Hole, None));
    };
    let target64 = u64::from(target);
    let mut held: Option<BlockGuard<'c>> = None;

    loop {
        match node {
            ExtentNode::Leaf(extents) => {
                let found = search_by_range(&extents, |ext, _| {
                    half_open_range(
                        target64,
                        u64::from(ext.logical_block),
                        u64::from(ext.len()),
                    )
                });
                let mapping = match found.map(|i| extents[i]) {
                    Some(ext) => {
                        let physical = BlockNumber(ext.physical_start)
                            .checked_add(u64::from(target - ext.logical_block))
                            .ok_or_else(|| tree_corrupt(ino, "physical block overflows u64"))?;
                        if ext.is_uninit() {
                            Mapping::Unwritten(physical)
                        } else {
                            Mapping::Mapped(physical)
                        }
                    }
                    None => Mapping::Hole,
                };
                trace!(ino = ino.0, logical, ?mapping, "extent leaf");
                return Ok((mapping, held));
            }
            ExtentNode::Index(indexes) => {
                let found = search_by_range(&indexes, |idx, next| {
                    until_next_range(
                        target64,
                        u64::from(idx.logical_block),
                        next.map(|n| u64::from(n.logical_block)),
                    )
                });
                let Some(i) = found else {
                    return Err(tree_corrupt(
                        ino,
                        format!(
                            "no index entry covers logical block {logical} at depth {}",
                            header.depth
                        ),
                    ));
                };
                let child_block = BlockNumber(indexes[i].child_block);
                trace!(
                    ino = ino.0,
                    depth = header.depth,
                    child = child_block.0,
                    "extent index descent"
                );

                let child = cache.request_block(child_block, true)?;
                let (child_header, child_node) = parse_extent_node(&child)
                    .map_err(|e| tree_corrupt(ino, format!("node at block {child_block}: {e}")))?;
                if child_header.depth + 1 != header.depth {
                    return Err(tree_corrupt(
                        ino,
                        format!(
                            "node at block {child_block} has depth {} under depth {}",
                            child_header.depth, header.depth
                        ),
                    ));
                }
                // Child is held; the parent guard goes now.
                held = Some(child);
                header = child_header;
                node = child_node;
            }
        }
    }
}

/// Indirection level and slot for a classic logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClassicPath {
    /// Slot of `i_block` that starts the walk.
    root_slot: usize,
    /// Number of pointer blocks to read (0 for direct).
    levels: u32,
    /// Offset of the target within the level's range.
    relative: u64,
}

/// Place `logical` in the direct, single, double or triple indirect range.
///
/// `per_block` is the number of 4-byte block pointers an indirect block
/// holds (`block_size / 4`), not a byte count. Range widths are powers of
/// it, and at walk step `k` of `levels` the slot is
/// `(relative / per_block^(levels - k)) % per_block`.
fn classic_path(logical: u64, per_block: u64) -> Option<ClassicPath> {
    let direct = EXT4_NDIR_BLOCKS as u64;
    if logical < direct {
        return Some(ClassicPath {
            root_slot: usize::try_from(logical).ok()?,
            levels: 0,
            relative: 0,
        });
    }

    let single = direct;
    let double = single + per_block;
    let triple = double.checked_add(per_block.checked_mul(per_block)?)?;
    let end = triple.checked_add(per_block.checked_pow(3)?)?;

    let (root_slot, levels, start) = if logical < double {
        (EXT4_IND_BLOCK, 1, single)
    } else if logical < triple {
        (EXT4_DIND_BLOCK, 2, double)
    } else if logical < end {
        (EXT4_TIND_BLOCK, 3, triple)
    } else {
        return None;
    };
    Some(ClassicPath {
        root_slot,
        levels,
        relative: logical - start,
    })
}

fn locate_classic<'c>(
    cache: &'c dyn BufferCache,
    ino: InodeNumber,
    ptrs: &[u32; 15],
    logical: u64,
) -> Result<(BlockNumber, Option<BlockGuard<'c>>)> {
    let per_block = cache.block_size().pointers_per_block();
    let path = classic_path(logical, per_block).ok_or_else(|| {
        Ext4Error::Parse(format!(
            "logical block {logical} of inode {ino} lies beyond the triple-indirect range"
        ))
    })?;

    let mut ptr = ptrs[path.root_slot];
    let mut held: Option<BlockGuard<'c>> = None;

    for remaining in (0..path.levels).rev() {
        // Logical blocks covered by one pointer at this level: per_block^remaining.
        let unit = per_block.pow(remaining);
        let slot = (path.relative / unit) % per_block;
        if ptr == 0 {
            trace!(ino = ino.0, logical, remaining, "following zero indirect pointer");
        }
        let pointer_block = BlockNumber(u64::from(ptr));
        let guard = cache.request_block(pointer_block, true)?;
        let offset = usize::try_from(slot * 4)
            .map_err(|_| Ext4Error::Parse("pointer slot does not fit usize".to_owned()))?;
        let next = Fields::new(&guard, 0)
            .and_then(|block| block.u32(offset))
            .map_err(|e| Ext4Error::Corruption {
                block: pointer_block.0,
                detail: e.to_string(),
            })?;
        trace!(
            ino = ino.0,
            level = path.levels - remaining,
            block = pointer_block.0,
            slot,
            next,
            "indirect step"
        );
        held = Some(guard);
        ptr = next;
    }

    if ptr == 0 {
        trace!(ino = ino.0, logical, "zero data pointer");
    }
    Ok((BlockNumber(u64::from(ptr)), held))
}
