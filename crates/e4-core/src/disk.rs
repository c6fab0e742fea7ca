//! Partition selection for whole-disk devices.

use e4_block::{ByteDevice, read_sector0};
use e4_error::{Ext4Error, Result};
use e4_ondisk::{MbrPartition, PartitionTable, PartitionTableKind, PartitionType, read_partition_table};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where on a disk the filesystem was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPlacement {
    pub start_lba: u64,
    /// Length of the chosen partition; `None` for a bare filesystem.
    pub len_sectors: Option<u64>,
    /// 1-based MBR slot.
    pub partition: Option<u8>,
}

impl DiskPlacement {
    const BARE: Self = Self {
        start_lba: 0,
        len_sectors: None,
        partition: None,
    };
}

/// Read sector 0 of `dev` and decide which partition holds the volume.
///
/// A disk without a boot signature is taken as a bare filesystem. GPT disks
/// and FAT partitions are refused.
pub fn locate_filesystem(dev: &dyn ByteDevice, partition: Option<u8>) -> Result<DiskPlacement> {
    let sector0 = read_sector0(dev)?;
    let table = read_partition_table(&sector0).map_err(|e| Ext4Error::Parse(e.to_string()))?;
    debug!(kind = ?table.kind, partitions = table.partitions.len(), "partition table read");
    select_partition(&table, partition)
}

/// Pick a partition from a decoded table.
pub fn select_partition(table: &PartitionTable, partition: Option<u8>) -> Result<DiskPlacement> {
    match table.kind {
        PartitionTableKind::None => {
            if let Some(index) = partition {
                return Err(Ext4Error::NotFound(format!(
                    "partition {index}: device has no partition table"
                )));
            }
            Ok(DiskPlacement::BARE)
        }
        PartitionTableKind::Gpt => Err(Ext4Error::UnsupportedFeature(
            "GPT-partitioned disk; only MBR partition tables are read".to_owned(),
        )),
        PartitionTableKind::Mbr => {
            let chosen = match partition {
                Some(index) => table
                    .by_index(index)
                    .ok_or_else(|| Ext4Error::NotFound(format!("partition {index}")))?,
                None => table.first_linux().ok_or_else(|| no_linux_partition(table))?,
            };
            check_linux(chosen)?;
            info!(
                partition = chosen.index,
                start_lba = chosen.start_lba,
                sectors = chosen.size_sectors,
                "using MBR partition"
            );
            Ok(DiskPlacement {
                start_lba: chosen.start_lba,
                len_sectors: Some(chosen.size_sectors),
                partition: Some(chosen.index),
            })
        }
    }
}

fn check_linux(part: &MbrPartition) -> Result<()> {
    match part.partition_type {
        PartitionType::LinuxNative => Ok(()),
        ty if ty.is_fat() => Err(Ext4Error::UnsupportedFeature(format!(
            "partition {} is FAT ({ty:?}), not ext4",
            part.index
        ))),
        ty => Err(Ext4Error::UnsupportedFeature(format!(
            "partition {} has type {ty:?}, not Linux",
            part.index
        ))),
    }
}

fn no_linux_partition(table: &PartitionTable) -> Ext4Error {
    if let Some(fat) = table.partitions.iter().find(|p| p.partition_type.is_fat()) {
        return Ext4Error::UnsupportedFeature(format!(
            "only a FAT partition ({}) is present",
            fat.index
        ));
    }
    Ext4Error::UnsupportedFeature("no Linux partition in the MBR".to_owned())
}
