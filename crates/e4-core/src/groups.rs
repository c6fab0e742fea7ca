//! Block group descriptor table.

use e4_block::BufferCache;
use e4_error::{Ext4Error, Result};
use e4_ondisk::{Ext4GroupDesc, Ext4Superblock};
use e4_types::{BlockNumber, GroupNumber};
use serde::Serialize;
use tracing::{debug, trace};

/// Every group descriptor of a mounted volume, decoded once at mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockGroupTable {
    descs: Vec<Ext4GroupDesc>,
}

impl BlockGroupTable {
    /// Read the descriptor table that starts in the block after the
    /// superblock's, one cached block at a time.
    pub fn build(sb: &Ext4Superblock, cache: &dyn BufferCache) -> Result<Self> {
        let count = sb.groups_count();
        let count = u32::try_from(count).map_err(|_| {
            Ext4Error::BadSuperblock(format!("{count} block groups exceed the 32-bit group space"))
        })?;
        if count == 0 {
            return Err(Ext4Error::BadSuperblock("volume has no block groups".to_owned()));
        }
        let desc_size = sb.group_desc_size();
        let per_block = sb.descriptors_per_block();
        if per_block == 0 {
            return Err(Ext4Error::BadSuperblock(format!(
                "descriptor size {desc_size} exceeds block size {}",
                sb.block_size
            )));
        }

        let first = sb.group_desc_table_block();
        let stride = usize::from(desc_size);
        let mut descs = Vec::new();
        let mut table_block = first;
        while descs.len() < count as usize {
            let guard = cache.request_block(BlockNumber(table_block), false)?;
            let remaining = count as usize - descs.len();
            for chunk in guard.chunks_exact(stride).take(remaining) {
                let desc = Ext4GroupDesc::parse_from_bytes(chunk, desc_size).map_err(|e| {
                    Ext4Error::Corruption {
                        block: table_block,
                        detail: format!("group descriptor {}: {e}", descs.len()),
                    }
                })?;
                descs.push(desc);
            }
            trace!(block = table_block, decoded = descs.len(), "group descriptor block");
            table_block += 1;
        }

        debug!(
            groups = count,
            desc_size,
            table_start = first,
            table_blocks = table_block - first,
            "block group table built"
        );
        Ok(Self { descs })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    #[must_use]
    pub fn get(&self, group: GroupNumber) -> Option<&Ext4GroupDesc> {
        self.descs.get(usize::try_from(group.0).ok()?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupNumber, &Ext4GroupDesc)> {
        (0_u32..).map(GroupNumber).zip(self.descs.iter())
    }
}
