//! Hashed directory descent.

use crate::{DirMatch, HtreeParams, block_label, scan_block};
use e4_block::{BlockGuard, BufferCache};
use e4_error::{Ext4Error, Result};
use e4_extent::resolve;
use e4_ondisk::{DxEntry, DxHashVersion, Ext4Inode, dx_hash, parse_dx_node, parse_dx_root};
use e4_types::{InodeNumber, search_by_range, until_next_range};
use tracing::{trace, warn};

fn search_failed(ino: InodeNumber, detail: impl Into<String>) -> Ext4Error {
    let detail = detail.into();
    warn!(ino = ino.0, %detail, "htree search failed");
    Ext4Error::HTreeSearchFailed { ino: ino.0, detail }
}

/// Index entry owning `hash`: the last one whose start is not above it.
fn covering_entry(entries: &[DxEntry], hash: u32) -> Option<usize> {
    search_by_range(entries, |entry, next| {
        until_next_range(
            u64::from(hash),
            u64::from(entry.hash),
            next.map(|n| u64::from(n.hash)),
        )
    })
}

/// One index level on the way down: its entries and the one taken.
struct Frame {
    entries: Vec<DxEntry>,
    at: usize,
}

impl Frame {
    fn taken(&self) -> DxEntry {
        self.entries[self.at]
    }
}

pub(crate) fn lookup(
    cache: &dyn BufferCache,
    params: HtreeParams,
    ino: InodeNumber,
    dir: &Ext4Inode,
    name: &[u8],
) -> Result<Option<DirMatch>> {
    let root_guard = resolve(cache, ino, dir, 0, true)?;
    let root = parse_dx_root(&root_guard).map_err(|e| search_failed(ino, format!("root: {e}")))?;

    let Some(version) = DxHashVersion::effective(root.hash_version, params.unsigned_hash) else {
        warn!(ino = ino.0, hash_version = root.hash_version, "unknown htree hash version");
        return Err(Ext4Error::UnsupportedFeature(format!(
            "htree hash version {} in directory {ino}",
            root.hash_version
        )));
    };
    if root.indirect_levels >= params.max_index_levels() {
        return Err(search_failed(
            ino,
            format!("{} indirect levels exceed the volume limit", root.indirect_levels),
        ));
    }

    let hash = dx_hash(version, name, &params.hash_seed);
    trace!(
        ino = ino.0,
        ?version,
        major = hash.major,
        minor = hash.minor,
        levels = root.indirect_levels,
        "htree lookup"
    );

    let mut held: BlockGuard<'_> = root_guard;
    let mut path: Vec<Frame> = Vec::with_capacity(usize::from(root.indirect_levels) + 1);
    let mut entries = root.entries;

    for level in 0..=root.indirect_levels {
        let at = covering_entry(&entries, hash.major).ok_or_else(|| {
            search_failed(ino, format!("no entry covers hash {:#x} at level {level}", hash.major))
        })?;
        let frame = Frame { entries, at };
        let target = frame.taken();
        trace!(ino = ino.0, level, block = target.block, "htree step");
        path.push(frame);

        if level == root.indirect_levels {
            break;
        }
        let child = resolve(cache, ino, dir, u64::from(target.block), true)?;
        let node = parse_dx_node(&child)
            .map_err(|e| search_failed(ino, format!("node at logical {}: {e}", target.block)))?;
        // Child acquired; only now does the parent go.
        held = child;
        entries = node.entries;
    }

    loop {
        let Some(leaf_block) = path.last().map(|f| f.taken().block) else {
            return Err(search_failed(ino, "empty descent path"));
        };
        let leaf = resolve(cache, ino, dir, u64::from(leaf_block), true)?;
        drop(held);
        let found = scan_block(&leaf, cache.block_size().get(), name).map_err(|detail| {
            search_failed(
                ino,
                format!("leaf block {}: {detail}", block_label(leaf.block())),
            )
        })?;
        if found.is_some() {
            return Ok(found);
        }
        held = leaf;

        if !advance_on_collision(cache, ino, dir, &mut path, hash.major)? {
            return Ok(None);
        }
    }
}

/// Move `path` to the next leaf when that leaf continues a run of names
/// sharing `major`. Returns `false` when the run ends here.
fn advance_on_collision(
    cache: &dyn BufferCache,
    ino: InodeNumber,
    dir: &Ext4Inode,
    path: &mut [Frame],
    major: u32,
) -> Result<bool> {
    // Climb to the deepest level that still has a next entry.
    let Some(level) = path.iter().rposition(|f| f.at + 1 < f.entries.len()) else {
        return Ok(false);
    };
    path[level].at += 1;
    let next_hash = path[level].taken().hash;
    if next_hash & 1 == 0 || next_hash & !1 != major {
        return Ok(false);
    }
    trace!(ino = ino.0, level, next_hash, "htree hash collision continues");

    // Re-enter the lower levels at their first entry.
    let mut held: Option<BlockGuard<'_>> = None;
    for lower in level + 1..path.len() {
        let block = path[lower - 1].taken().block;
        let guard = resolve(cache, ino, dir, u64::from(block), true)?;
        let node = parse_dx_node(&guard)
            .map_err(|e| search_failed(ino, format!("node at logical {block}: {e}")))?;
        path[lower] = Frame {
            entries: node.entries,
            at: 0,
        };
        held = Some(guard);
    }
    drop(held);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(hashes: &[u32]) -> Vec<DxEntry> {
        hashes
            .iter()
            .zip(1_u32..)
            .map(|(&hash, block)| DxEntry { hash, block })
            .collect()
    }

    #[test]
    fn covering_entry_is_last_start_not_above_hash() {
        let e = entries(&[0, 0x100, 0x200]);
        assert_eq!(covering_entry(&e, 0), Some(0));
        assert_eq!(covering_entry(&e, 0xFF), Some(0));
        assert_eq!(covering_entry(&e, 0x100), Some(1));
        assert_eq!(covering_entry(&e, 0x1FE), Some(1));
        assert_eq!(covering_entry(&e, 0xFFFF_FFFC), Some(2));
    }

    #[test]
    fn continuation_start_sends_equal_hash_left() {
        // An entry starting at h|1 begins after h itself.
        let e = entries(&[0, 0x101]);
        assert_eq!(covering_entry(&e, 0x100), Some(0));
        assert_eq!(covering_entry(&e, 0x102), Some(1));
    }
}
