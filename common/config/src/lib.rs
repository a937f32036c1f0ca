// Licensed under the Apache-2.0 license

//! Flash geometry and the fixed system partitions of the target platform.
//! These are the defaults; a TOML file can override any of them (see `options`).

mod options;

pub use options::{load_config, FlasherConfig, FlasherOptions};

use anyhow::{bail, Result};
use partition_table::{
    PartitionDescriptor, PartitionKind, SUBTYPE_DATA_NVS, SUBTYPE_DATA_OTA, SUBTYPE_FACTORY,
};
use serde::{Deserialize, Serialize};

pub const KIB: u32 = 1024;
pub const MIB: u32 = 1024 * KIB;

pub const DEFAULT_FLASH_SIZE: u32 = 16 * MIB;
pub const SECTOR_SIZE: u32 = 4 * KIB; // Erase granularity
pub const APP_ALIGNMENT: u32 = 64 * KIB; // Erase block size used for application slots
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const PARTITION_TABLE_SIZE: u32 = 0xC00; // Reserved table region, 96 slots
pub const MAX_PARTITIONS: usize = 95;
pub const MAX_OTA_SLOTS: usize = 16;

// Application image header
pub const IMAGE_MAGIC: u8 = 0xE9;
pub const IMAGE_SEGMENT_COUNT_OFFSET: usize = 1;
pub const MAX_IMAGE_SEGMENTS: u8 = 16;
pub const IMAGE_CHECKSUM_FIELD_OFFSET: usize = 23;
pub const IMAGE_CHECKSUM_FIELD_LEN: usize = 1;

pub const MIN_FIRMWARE_SIZE: u64 = 4 * KIB as u64;
pub const MAX_FIRMWARE_SIZE: u64 = 16 * MIB as u64;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// The platform's canonical fixed regions. These never move and are never resized.
pub fn canonical_fixed_partitions() -> Vec<PartitionDescriptor> {
    let mut factory = PartitionDescriptor::new(
        "factory",
        PartitionKind::FactoryApp,
        SUBTYPE_FACTORY,
        0x10000,
        MIB,
    );
    factory.is_readonly = true;

    vec![
        PartitionDescriptor::new("bootloader", PartitionKind::Bootloader, 0, 0x0, 0x8000),
        PartitionDescriptor::new(
            "partition_table",
            PartitionKind::PartitionTable,
            0,
            PARTITION_TABLE_OFFSET,
            0x1000,
        ),
        PartitionDescriptor::new(
            "nvs",
            PartitionKind::SystemData,
            SUBTYPE_DATA_NVS,
            0x9000,
            0x5000,
        ),
        PartitionDescriptor::new(
            "otadata",
            PartitionKind::SystemData,
            SUBTYPE_DATA_OTA,
            0xE000,
            0x2000,
        ),
        factory,
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub flash_size: u32,
    pub sector_size: u32,
    pub app_alignment: u32,
    pub table_offset: u32,
    pub table_size: u32,
    pub max_partitions: usize,
    pub max_ota_slots: usize,
    pub fixed_partitions: Vec<PartitionDescriptor>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            flash_size: DEFAULT_FLASH_SIZE,
            sector_size: SECTOR_SIZE,
            app_alignment: APP_ALIGNMENT,
            table_offset: PARTITION_TABLE_OFFSET,
            table_size: PARTITION_TABLE_SIZE,
            max_partitions: MAX_PARTITIONS,
            max_ota_slots: MAX_OTA_SLOTS,
            fixed_partitions: canonical_fixed_partitions(),
        }
    }
}

impl PlatformConfig {
    /// End of the fixed region, aligned up to where the first OTA slot may start.
    pub fn ota_start(&self) -> u64 {
        let end = self
            .fixed_partitions
            .iter()
            .map(|p| p.end())
            .max()
            .unwrap_or(0);
        align_up(end, self.app_alignment as u64)
    }

    /// Size of the table region once rounded up to whole erase sectors.
    pub fn table_erase_len(&self) -> u32 {
        align_up(self.table_size as u64, self.sector_size as u64) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            bail!("Sector size {:#x} is not a power of two", self.sector_size);
        }
        if self.app_alignment == 0 || self.app_alignment % self.sector_size != 0 {
            bail!(
                "Application alignment {:#x} is not a multiple of the sector size",
                self.app_alignment
            );
        }
        if self.table_offset % self.sector_size != 0 {
            bail!("Partition table offset {:#x} is not sector aligned", self.table_offset);
        }
        if self.table_offset as u64 + self.table_erase_len() as u64 > self.flash_size as u64 {
            bail!("Partition table region lies outside the flash");
        }
        if self.fixed_partitions.len() > self.max_partitions {
            bail!(
                "{} fixed partitions exceed the limit of {}",
                self.fixed_partitions.len(),
                self.max_partitions
            );
        }
        for (i, partition) in self.fixed_partitions.iter().enumerate() {
            if partition.offset % self.sector_size != 0 || partition.size % self.sector_size != 0 {
                bail!("Fixed partition '{}' is not sector aligned", partition.name);
            }
            if partition.end() > self.flash_size as u64 {
                bail!("Fixed partition '{}' lies outside the flash", partition.name);
            }
            if partition.is_ota {
                bail!("Fixed partition '{}' cannot be an OTA slot", partition.name);
            }
            for other in &self.fixed_partitions[i + 1..] {
                if partition.overlaps(other) {
                    bail!(
                        "Fixed partitions '{}' and '{}' overlap",
                        partition.name,
                        other.name
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_platform_is_valid() {
        let platform = PlatformConfig::default();
        platform.validate().unwrap();
        assert_eq!(platform.ota_start(), 0x110000);
        assert_eq!(platform.table_erase_len(), 0x1000);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 0x10000), 0);
        assert_eq!(align_up(1, 0x10000), 0x10000);
        assert_eq!(align_up(0x10000, 0x10000), 0x10000);
        assert_eq!(align_up(0x10001, 0x10000), 0x20000);
    }

    #[test]
    fn test_overlapping_fixed_partitions_rejected() {
        let mut platform = PlatformConfig::default();
        platform.fixed_partitions[3].offset = 0xD000;
        assert!(platform.validate().is_err());
    }

    #[test]
    fn test_unaligned_fixed_partition_rejected() {
        let mut platform = PlatformConfig::default();
        platform.fixed_partitions[2].size = 0x4800;
        assert!(platform.validate().is_err());
    }
}
