// Licensed under the Apache-2.0 license

use serde::{Deserialize, Serialize};

use crate::{
    FLAG_ENCRYPTED, FLAG_READONLY, SUBTYPE_FACTORY, SUBTYPE_OTA_BASE, SUBTYPE_OTA_MAX, TYPE_APP,
    TYPE_BOOTLOADER, TYPE_DATA, TYPE_PARTITION_TABLE,
};

/// Purpose of a flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Bootloader,
    PartitionTable,
    SystemData,
    FactoryApp,
    OtaApp,
}

impl PartitionKind {
    /// The type byte written into a table entry.
    pub fn type_byte(self) -> u8 {
        match self {
            PartitionKind::Bootloader => TYPE_BOOTLOADER,
            PartitionKind::PartitionTable => TYPE_PARTITION_TABLE,
            PartitionKind::SystemData => TYPE_DATA,
            PartitionKind::FactoryApp | PartitionKind::OtaApp => TYPE_APP,
        }
    }

    /// Recovers the kind from the raw type and subtype bytes of an entry.
    pub fn from_raw(type_byte: u8, subtype: u8) -> Option<Self> {
        match type_byte {
            TYPE_BOOTLOADER => Some(PartitionKind::Bootloader),
            TYPE_PARTITION_TABLE => Some(PartitionKind::PartitionTable),
            TYPE_DATA => Some(PartitionKind::SystemData),
            TYPE_APP if subtype == SUBTYPE_FACTORY => Some(PartitionKind::FactoryApp),
            TYPE_APP if (SUBTYPE_OTA_BASE..=SUBTYPE_OTA_MAX).contains(&subtype) => {
                Some(PartitionKind::OtaApp)
            }
            _ => None,
        }
    }

    pub fn is_app(self) -> bool {
        matches!(self, PartitionKind::FactoryApp | PartitionKind::OtaApp)
    }
}

/// One region of the flash address space.
///
/// `firmware` indexes the firmware candidate this partition was allocated for;
/// system partitions and partitions read back from flash carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub name: String,
    pub kind: PartitionKind,
    #[serde(default)]
    pub subtype: u8,
    pub offset: u32,
    pub size: u32,
    #[serde(default)]
    pub is_ota: bool,
    #[serde(default)]
    pub is_readonly: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(skip)]
    pub firmware: Option<usize>,
}

impl PartitionDescriptor {
    pub fn new(name: &str, kind: PartitionKind, subtype: u8, offset: u32, size: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            subtype,
            offset,
            size,
            is_ota: kind == PartitionKind::OtaApp,
            is_readonly: false,
            is_encrypted: false,
            firmware: None,
        }
    }

    /// Creates the `index`-th OTA application slot, named `ota_<index>`.
    pub fn ota(index: usize, offset: u32, size: u32, firmware: Option<usize>) -> Self {
        let mut descriptor = Self::new(
            &format!("ota_{}", index),
            PartitionKind::OtaApp,
            SUBTYPE_OTA_BASE.saturating_add(index as u8),
            offset,
            size,
        );
        descriptor.firmware = firmware;
        descriptor
    }

    /// Exclusive end address. Computed in 64 bits so that a corrupt entry can't wrap.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub fn overlaps(&self, other: &PartitionDescriptor) -> bool {
        (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.offset as u64..self.end()).contains(&address)
    }

    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.is_encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.is_readonly {
            flags |= FLAG_READONLY;
        }
        flags
    }

    /// Compares only what is stored in a table entry.
    pub fn same_entry(&self, other: &PartitionDescriptor) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.subtype == other.subtype
            && self.offset == other.offset
            && self.size == other.size
            && self.flags() == other.flags()
    }
}

/// An ordered set of partitions: fixed system partitions first, then OTA slots
/// in allocation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionLayout {
    pub partitions: Vec<PartitionDescriptor>,
    pub total_used_size: u64,
    pub is_valid: bool,
}

impl PartitionLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_partitions(partitions: Vec<PartitionDescriptor>) -> Self {
        let total_used_size = partitions.iter().map(|p| p.size as u64).sum();
        Self {
            partitions,
            total_used_size,
            is_valid: false,
        }
    }

    pub fn push(&mut self, descriptor: PartitionDescriptor) {
        self.total_used_size += descriptor.size as u64;
        self.is_valid = false;
        self.partitions.push(descriptor);
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.partitions.iter()
    }

    pub fn get(&self, index: usize) -> Option<&PartitionDescriptor> {
        self.partitions.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&PartitionDescriptor> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn ota_partitions(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        self.partitions.iter().filter(|p| p.is_ota)
    }

    /// Highest end address of any partition.
    pub fn end_offset(&self) -> u64 {
        self.partitions.iter().map(|p| p.end()).max().unwrap_or(0)
    }

    /// Bytes left between the last partition and the end of flash.
    pub fn remaining(&self, flash_size: u64) -> u64 {
        flash_size.saturating_sub(self.end_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_raw() {
        assert_eq!(
            PartitionKind::from_raw(TYPE_APP, 0x00),
            Some(PartitionKind::FactoryApp)
        );
        assert_eq!(
            PartitionKind::from_raw(TYPE_APP, 0x13),
            Some(PartitionKind::OtaApp)
        );
        assert_eq!(
            PartitionKind::from_raw(TYPE_DATA, 0x02),
            Some(PartitionKind::SystemData)
        );
        assert_eq!(PartitionKind::from_raw(TYPE_APP, 0x20), None);
        assert_eq!(PartitionKind::from_raw(0x40, 0x00), None);
    }

    #[test]
    fn test_overlap() {
        let a = PartitionDescriptor::ota(0, 0x10000, 0x10000, None);
        let b = PartitionDescriptor::ota(1, 0x20000, 0x10000, None);
        let c = PartitionDescriptor::ota(2, 0x1f000, 0x2000, None);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert_eq!(a.name, "ota_0");
        assert_eq!(b.subtype, 0x11);
    }

    #[test]
    fn test_layout_accounting() {
        let mut layout = PartitionLayout::new();
        layout.push(PartitionDescriptor::ota(0, 0x10000, 0x20000, Some(3)));
        layout.push(PartitionDescriptor::ota(1, 0x30000, 0x10000, Some(1)));
        assert_eq!(layout.total_used_size, 0x30000);
        assert_eq!(layout.end_offset(), 0x40000);
        assert_eq!(layout.remaining(0x100000), 0xc0000);
        assert_eq!(layout.find("ota_1").map(|p| p.firmware), Some(Some(1)));
        assert!(!layout.is_valid);
    }
}
