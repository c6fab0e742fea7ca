#![forbid(unsafe_code)]
//! Directory name lookup.
//!
//! Linear scan over every directory block, or hashed (htree) descent when
//! the directory inode carries the index flag. Block buffers come from the
//! block address resolver, so holes and both mapping schemes are handled
//! the same way file data is.

mod htree;

use e4_block::BufferCache;
use e4_error::{Ext4Error, Result};
use e4_extent::resolve;
use e4_ondisk::{DirBlockIter, Ext4FileType, Ext4Inode, Ext4Superblock, Feature};
use e4_types::{BlockNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Volume-wide inputs to the directory hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtreeParams {
    pub hash_seed: [u32; 4],
    /// Names were hashed as unsigned bytes when the index was built.
    pub unsigned_hash: bool,
    /// `largedir` allows a third index level.
    pub largedir: bool,
}

impl HtreeParams {
    /// Take the seed and hash signedness from `sb`, unless `unsigned_override`
    /// forces the signedness.
    #[must_use]
    pub fn from_superblock(sb: &Ext4Superblock, unsigned_override: Option<bool>) -> Self {
        Self {
            hash_seed: sb.hash_seed,
            unsigned_hash: unsigned_override.unwrap_or_else(|| sb.uses_unsigned_hash()),
            largedir: sb.features.has(Feature::LARGEDIR),
        }
    }

    fn max_index_levels(self) -> u8 {
        if self.largedir { 3 } else { 2 }
    }
}

/// A name found in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirMatch {
    pub ino: InodeNumber,
    pub file_type: Ext4FileType,
}

/// Owned directory entry for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryView {
    pub ino: u64,
    pub name: String,
    #[serde(skip)]
    pub raw_name: Vec<u8>,
    pub file_type: Ext4FileType,
}

/// Name lookup over one mounted volume.
pub struct DirectoryLookup<'c> {
    cache: &'c dyn BufferCache,
    params: HtreeParams,
}

impl<'c> DirectoryLookup<'c> {
    #[must_use]
    pub fn new(cache: &'c dyn BufferCache, params: HtreeParams) -> Self {
        Self { cache, params }
    }

    /// Find `name` in directory `dir`.
    ///
    /// `.` answers with the directory itself. `..` is refused on an indexed
    /// directory; parent resolution belongs to the caller there.
    pub fn lookup(&self, dir_ino: InodeNumber, dir: &Ext4Inode, name: &[u8]) -> Result<DirMatch> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        if name == b"." {
            return Ok(DirMatch {
                ino: dir_ino,
                file_type: Ext4FileType::Dir,
            });
        }

        let found = if dir.has_htree_index() {
            if name == b".." {
                return Err(Ext4Error::UnsupportedFeature(
                    "'..' lookup through an htree index".to_owned(),
                ));
            }
            htree::lookup(self.cache, self.params, dir_ino, dir, name)?
        } else {
            self.linear_lookup(dir_ino, dir, name)?
        };

        found.ok_or_else(|| Ext4Error::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Scan every block of `dir` in logical order.
    pub fn linear_lookup(
        &self,
        dir_ino: InodeNumber,
        dir: &Ext4Inode,
        name: &[u8],
    ) -> Result<Option<DirMatch>> {
        for logical in 0..self.block_count(dir) {
            let guard = resolve(self.cache, dir_ino, dir, logical, false)?;
            if guard.is_transient() {
                trace!(ino = dir_ino.0, logical, "directory hole skipped");
                continue;
            }
            let found = scan_block(&guard, self.cache.block_size().get(), name).map_err(
                |detail| {
                    let block = block_label(guard.block());
                    warn!(ino = dir_ino.0, block, %detail, "malformed directory block");
                    Ext4Error::Corruption { block, detail }
                },
            )?;
            if found.is_some() {
                trace!(ino = dir_ino.0, logical, "linear scan hit");
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// List every live entry of `dir`, including `.` and `..`.
    pub fn read_dir(&self, dir_ino: InodeNumber, dir: &Ext4Inode) -> Result<Vec<DirEntryView>> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        let bs = self.cache.block_size().get();
        let mut out = Vec::new();
        for logical in 0..self.block_count(dir) {
            let guard = resolve(self.cache, dir_ino, dir, logical, false)?;
            if guard.is_transient() {
                continue;
            }
            for entry in DirBlockIter::new(&guard, bs) {
                let entry = entry.map_err(|e| Ext4Error::Corruption {
                    block: block_label(guard.block()),
                    detail: e.to_string(),
                })?;
                out.push(DirEntryView {
                    ino: u64::from(entry.inode),
                    name: entry.name_str(),
                    raw_name: entry.name.to_vec(),
                    file_type: entry.file_type,
                });
            }
        }
        Ok(out)
    }

    /// Blocks spanned by the directory. Directory sizes always use both
    /// size words.
    fn block_count(&self, dir: &Ext4Inode) -> u64 {
        dir.size_bytes(true)
            .div_ceil(u64::from(self.cache.block_size().get()))
    }
}

/// Look for `name` among the live entries of one block.
fn scan_block(
    block: &[u8],
    block_size: u32,
    name: &[u8],
) -> std::result::Result<Option<DirMatch>, String> {
    e4_ondisk::find_in_dir_block(block, block_size, name)
        .map(|hit| {
            hit.map(|entry| DirMatch {
                ino: InodeNumber(u64::from(entry.inode)),
                file_type: entry.file_type,
            })
        })
        .map_err(|e| e.to_string())
}

/// Physical block of a guard, for diagnostics.
fn block_label(block: Option<BlockNumber>) -> u64 {
    block.map_or(0, |b| b.0)
}
