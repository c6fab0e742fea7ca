#![forbid(unsafe_code)]
//! Master boot record partition table.
//!
//! Only the four primary entries of sector 0 are decoded. A protective
//! entry of type `0xEE` marks a GPT disk, which is reported but not walked.

use e4_types::{Fields, ParseError};
use serde::{Deserialize, Serialize};

pub const MBR_SECTOR_SIZE: usize = 512;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_SIGNATURE_OFFSET: usize = 510;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    Empty,
    Fat12,
    Fat16Small,
    Fat16Large,
    Fat32,
    Fat32Lba,
    Fat16Lba,
    Ntfs,
    Extended,
    LinuxSwap,
    LinuxNative,
    GptProtective,
    Unknown(u8),
}

impl From<u8> for PartitionType {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => Self::Empty,
            0x01 => Self::Fat12,
            0x04 => Self::Fat16Small,
            0x06 => Self::Fat16Large,
            0x0B => Self::Fat32,
            0x0C => Self::Fat32Lba,
            0x0E => Self::Fat16Lba,
            0x07 => Self::Ntfs,
            0x05 | 0x0F => Self::Extended,
            0x82 => Self::LinuxSwap,
            0x83 => Self::LinuxNative,
            0xEE => Self::GptProtective,
            other => Self::Unknown(other),
        }
    }
}

impl PartitionType {
    #[must_use]
    pub fn is_fat(self) -> bool {
        matches!(
            self,
            Self::Fat12
                | Self::Fat16Small
                | Self::Fat16Large
                | Self::Fat32
                | Self::Fat32Lba
                | Self::Fat16Lba
        )
    }
}

/// One non-empty primary partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbrPartition {
    /// 1-based slot number.
    pub index: u8,
    pub partition_type: PartitionType,
    pub bootable: bool,
    pub start_lba: u64,
    pub size_sectors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionTableKind {
    /// No boot signature: the device holds a bare filesystem.
    None,
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub kind: PartitionTableKind,
    pub partitions: Vec<MbrPartition>,
}

impl PartitionTable {
    /// First Linux native partition, if any.
    #[must_use]
    pub fn first_linux(&self) -> Option<&MbrPartition> {
        self.partitions
            .iter()
            .find(|p| p.partition_type == PartitionType::LinuxNative)
    }

    #[must_use]
    pub fn by_index(&self, index: u8) -> Option<&MbrPartition> {
        self.partitions.iter().find(|p| p.index == index)
    }
}

/// Decode the partition table held in the first sector of a disk.
pub fn read_partition_table(sector0: &[u8]) -> Result<PartitionTable, ParseError> {
    let sector = Fields::new(sector0, MBR_SECTOR_SIZE)?;

    if sector.array(MBR_SIGNATURE_OFFSET)? != [0x55, 0xAA] {
        return Ok(PartitionTable {
            kind: PartitionTableKind::None,
            partitions: Vec::new(),
        });
    }

    let mut partitions = Vec::with_capacity(4);
    for slot in 0_u8..4 {
        let entry = sector.sub(
            MBR_TABLE_OFFSET + usize::from(slot) * MBR_ENTRY_SIZE,
            MBR_ENTRY_SIZE,
        )?;
        let type_byte = entry.u8(4)?;
        let size_sectors = entry.u32(12)?;
        if type_byte == 0 || size_sectors == 0 {
            continue;
        }
        partitions.push(MbrPartition {
            index: slot + 1,
            partition_type: PartitionType::from(type_byte),
            bootable: entry.u8(0)? == 0x80,
            start_lba: u64::from(entry.u32(8)?),
            size_sectors: u64::from(size_sectors),
        });
    }

    let kind = if partitions
        .iter()
        .any(|p| p.partition_type == PartitionType::GptProtective)
    {
        PartitionTableKind::Gpt
    } else {
        PartitionTableKind::Mbr
    };
    Ok(PartitionTable { kind, partitions })
}
