#![forbid(unsafe_code)]
//! On-disk format parsing for ext4.
//!
//! Pure parsing crate with no I/O. Turns byte slices into typed structures:
//! superblock, group descriptors, inodes with their block map, extent tree
//! nodes, directory entries, hashed directory index nodes and the MBR
//! partition table that may precede a filesystem.

pub mod ext4;
pub mod htree;
pub mod mbr;

pub use ext4::{
    BlockMap, DirBlockIter, DirEntryRef, Ext4FileType, Ext4GroupDesc, Ext4Inode, Ext4Superblock,
    Extent, ExtentHeader, ExtentIndex, ExtentNode, ExtentRoot, Feature, Features, FileKind,
    find_in_dir_block, parse_extent_node,
};
pub use htree::{DxEntry, DxHash, DxHashVersion, DxNode, DxRoot, dx_hash, parse_dx_node, parse_dx_root};
pub use mbr::{MbrPartition, PartitionTable, PartitionTableKind, PartitionType, read_partition_table};
