// Licensed under the Apache-2.0 license

//! Binary partition table stored at a fixed flash offset.
//!
//! The table is a run of 32-byte entries in layout order, followed by one
//! digest entry holding the MD5 of every preceding entry byte. Unused slots up
//! to the end of the reserved region are all-ones so that a sequential reader
//! stops at the first blank slot.
//!
//! ```text
//!  0      2     3        4          8         12                28      32
//!  +------+-----+--------+----------+---------+-----------------+-------+
//!  | AA50 | type| subtype| offset LE| size LE | name (NUL pad)  | flags |
//!  +------+-----+--------+----------+---------+-----------------+-------+
//!  | EBEB |          0xFF x 14                | MD5 of entries (16)     |
//!  +------+-----------------------------------+-------------------------+
//! ```

mod layout;

pub use layout::{PartitionDescriptor, PartitionKind, PartitionLayout};

use log::warn;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const ENTRY_SIZE: usize = core::mem::size_of::<RawPartitionEntry>();
pub const ENTRY_MAGIC: [u8; 2] = [0xAA, 0x50];
pub const DIGEST_MAGIC: [u8; 2] = [0xEB, 0xEB];
pub const FILL_BYTE: u8 = 0xFF;
pub const DIGEST_LEN: usize = 16;
pub const NAME_FIELD_LEN: usize = 16;
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

pub const TYPE_APP: u8 = 0x00;
pub const TYPE_DATA: u8 = 0x01;
pub const TYPE_BOOTLOADER: u8 = 0x02;
pub const TYPE_PARTITION_TABLE: u8 = 0x03;

pub const SUBTYPE_FACTORY: u8 = 0x00;
pub const SUBTYPE_OTA_BASE: u8 = 0x10;
pub const SUBTYPE_OTA_MAX: u8 = 0x1F;
pub const SUBTYPE_DATA_OTA: u8 = 0x00;
pub const SUBTYPE_DATA_PHY: u8 = 0x01;
pub const SUBTYPE_DATA_NVS: u8 = 0x02;

pub const FLAG_ENCRYPTED: u32 = 1 << 0;
pub const FLAG_READONLY: u32 = 1 << 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("partition name '{0}' is longer than {MAX_NAME_LEN} bytes")]
    NameTooLong(String),
    #[error("{count} entries do not fit in a {capacity}-entry table")]
    TooManyEntries { count: usize, capacity: usize },
    #[error("table buffer of {0} bytes is too small")]
    BufferTooSmall(usize),
    #[error("entry {0} has an unknown magic")]
    BadEntryMagic(usize),
    #[error("entry {index} has unknown type 0x{type_byte:02x}/0x{subtype:02x}")]
    UnknownKind {
        index: usize,
        type_byte: u8,
        subtype: u8,
    },
    #[error("table digest does not match its entries")]
    DigestMismatch,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawPartitionEntry {
    pub magic: [u8; 2],
    pub type_byte: u8,
    pub subtype: u8,
    pub offset: U32<LittleEndian>,
    pub size: U32<LittleEndian>,
    pub name: [u8; NAME_FIELD_LEN],
    pub flags: U32<LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<RawPartitionEntry>() == 32);

impl RawPartitionEntry {
    pub fn from_descriptor(descriptor: &PartitionDescriptor) -> Result<Self, TableError> {
        let name_bytes = descriptor.name.as_bytes();
        if name_bytes.len() > MAX_NAME_LEN {
            return Err(TableError::NameTooLong(descriptor.name.clone()));
        }
        let mut name = [0u8; NAME_FIELD_LEN];
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        Ok(Self {
            magic: ENTRY_MAGIC,
            type_byte: descriptor.kind.type_byte(),
            subtype: descriptor.subtype,
            offset: descriptor.offset.into(),
            size: descriptor.size.into(),
            name,
            flags: descriptor.flags().into(),
        })
    }

    pub fn to_descriptor(&self, index: usize) -> Result<PartitionDescriptor, TableError> {
        let kind = PartitionKind::from_raw(self.type_byte, self.subtype).ok_or(
            TableError::UnknownKind {
                index,
                type_byte: self.type_byte,
                subtype: self.subtype,
            },
        )?;
        let name_len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD_LEN);
        let name = String::from_utf8_lossy(&self.name[..name_len]);

        let mut descriptor = PartitionDescriptor::new(
            &name,
            kind,
            self.subtype,
            self.offset.get(),
            self.size.get(),
        );
        let flags = self.flags.get();
        descriptor.is_encrypted = flags & FLAG_ENCRYPTED != 0;
        descriptor.is_readonly = flags & FLAG_READONLY != 0;
        Ok(descriptor)
    }
}

/// Number of real entries a region of `table_size` bytes can hold, keeping one
/// slot for the digest entry.
pub fn entry_capacity(table_size: usize) -> usize {
    (table_size / ENTRY_SIZE).saturating_sub(1)
}

/// Encodes `layout` into a buffer covering the whole reserved table region.
pub fn serialize(layout: &PartitionLayout, table_size: usize) -> Result<Vec<u8>, TableError> {
    let capacity = entry_capacity(table_size);
    if capacity == 0 {
        return Err(TableError::BufferTooSmall(table_size));
    }
    if layout.len() > capacity {
        return Err(TableError::TooManyEntries {
            count: layout.len(),
            capacity,
        });
    }

    let mut buffer = vec![FILL_BYTE; table_size];
    for (slot, descriptor) in buffer.chunks_exact_mut(ENTRY_SIZE).zip(layout.iter()) {
        let entry = RawPartitionEntry::from_descriptor(descriptor)?;
        slot.copy_from_slice(entry.as_bytes());
    }

    let entries_len = layout.len() * ENTRY_SIZE;
    let digest = md5::compute(&buffer[..entries_len]);
    let trailer = &mut buffer[entries_len..entries_len + ENTRY_SIZE];
    trailer[..DIGEST_MAGIC.len()].copy_from_slice(&DIGEST_MAGIC);
    trailer[ENTRY_SIZE - DIGEST_LEN..].copy_from_slice(&digest.0);

    Ok(buffer)
}

/// Decodes a table image, verifying the digest entry when one is present.
pub fn deserialize(buffer: &[u8]) -> Result<PartitionLayout, TableError> {
    if buffer.len() < ENTRY_SIZE {
        return Err(TableError::BufferTooSmall(buffer.len()));
    }

    let mut partitions = Vec::new();
    let mut saw_digest = false;
    for (index, slot) in buffer.chunks_exact(ENTRY_SIZE).enumerate() {
        if slot.iter().all(|&b| b == FILL_BYTE) {
            break;
        }
        if slot[..2] == DIGEST_MAGIC {
            let digest = md5::compute(&buffer[..index * ENTRY_SIZE]);
            if slot[ENTRY_SIZE - DIGEST_LEN..] != digest.0 {
                return Err(TableError::DigestMismatch);
            }
            saw_digest = true;
            break;
        }
        let entry = RawPartitionEntry::read_from_bytes(slot)
            .map_err(|_| TableError::BufferTooSmall(buffer.len()))?;
        if entry.magic != ENTRY_MAGIC {
            return Err(TableError::BadEntryMagic(index));
        }
        partitions.push(entry.to_descriptor(index)?);
    }

    if !saw_digest {
        warn!("Partition table has no digest entry, contents not verified");
    }
    Ok(PartitionLayout::from_partitions(partitions))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE_SIZE: usize = 0xC00;

    fn sample_layout() -> PartitionLayout {
        let mut nvs = PartitionDescriptor::new(
            "nvs",
            PartitionKind::SystemData,
            SUBTYPE_DATA_NVS,
            0x9000,
            0x5000,
        );
        nvs.is_encrypted = true;
        let mut factory = PartitionDescriptor::new(
            "factory",
            PartitionKind::FactoryApp,
            SUBTYPE_FACTORY,
            0x10000,
            0x100000,
        );
        factory.is_readonly = true;
        PartitionLayout::from_partitions(vec![
            PartitionDescriptor::new("bootloader", PartitionKind::Bootloader, 0, 0x0, 0x8000),
            PartitionDescriptor::new(
                "partition_table",
                PartitionKind::PartitionTable,
                0,
                0x8000,
                0x1000,
            ),
            nvs,
            factory,
            PartitionDescriptor::ota(0, 0x110000, 0x40000, Some(1)),
            PartitionDescriptor::ota(1, 0x150000, 0x20000, Some(0)),
        ])
    }

    #[test]
    fn test_entry_layout() {
        let layout = sample_layout();
        let table = serialize(&layout, TABLE_SIZE).unwrap();
        assert_eq!(table.len(), TABLE_SIZE);

        // ota_0 is the fifth entry
        let entry = &table[4 * ENTRY_SIZE..5 * ENTRY_SIZE];
        assert_eq!(&entry[0..2], &[0xAA, 0x50]);
        assert_eq!(entry[2], TYPE_APP);
        assert_eq!(entry[3], 0x10);
        assert_eq!(&entry[4..8], &0x110000u32.to_le_bytes());
        assert_eq!(&entry[8..12], &0x40000u32.to_le_bytes());
        assert_eq!(&entry[12..17], b"ota_0");
        assert!(entry[17..28].iter().all(|&b| b == 0));
        assert_eq!(&entry[28..32], &[0, 0, 0, 0]);

        let nvs = &table[2 * ENTRY_SIZE..3 * ENTRY_SIZE];
        assert_eq!(&nvs[28..32], &FLAG_ENCRYPTED.to_le_bytes());
    }

    #[test]
    fn test_digest_trailer() {
        let layout = sample_layout();
        let table = serialize(&layout, TABLE_SIZE).unwrap();
        let entries_len = layout.len() * ENTRY_SIZE;
        let trailer = &table[entries_len..entries_len + ENTRY_SIZE];

        assert_eq!(&trailer[0..2], &DIGEST_MAGIC);
        assert!(trailer[2..16].iter().all(|&b| b == FILL_BYTE));
        assert_eq!(&trailer[16..32], &md5::compute(&table[..entries_len]).0);
        assert!(table[entries_len + ENTRY_SIZE..]
            .iter()
            .all(|&b| b == FILL_BYTE));
    }

    #[test]
    fn test_round_trip() {
        let layout = sample_layout();
        let table = serialize(&layout, TABLE_SIZE).unwrap();
        let decoded = deserialize(&table).unwrap();

        assert_eq!(decoded.len(), layout.len());
        for (original, read_back) in layout.iter().zip(decoded.iter()) {
            assert!(original.same_entry(read_back), "{:?}", read_back);
            assert_eq!(original.is_ota, read_back.is_ota);
            assert_eq!(read_back.firmware, None);
        }
        assert_eq!(decoded.total_used_size, layout.total_used_size);
    }

    #[test]
    fn test_empty_layout() {
        let table = serialize(&PartitionLayout::new(), TABLE_SIZE).unwrap();
        assert_eq!(&table[0..2], &DIGEST_MAGIC);
        assert_eq!(&table[16..32], &md5::compute(b"").0);
        assert!(deserialize(&table).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_entry_detected() {
        let layout = sample_layout();
        let mut table = serialize(&layout, TABLE_SIZE).unwrap();
        table[ENTRY_SIZE + 5] ^= 0x01;
        assert_eq!(deserialize(&table), Err(TableError::DigestMismatch));
    }

    #[test]
    fn test_bad_magic() {
        let layout = sample_layout();
        let mut table = serialize(&layout, TABLE_SIZE).unwrap();
        table[ENTRY_SIZE] = 0x00;
        assert_eq!(deserialize(&table), Err(TableError::BadEntryMagic(1)));
    }

    #[test]
    fn test_name_too_long() {
        let layout = PartitionLayout::from_partitions(vec![PartitionDescriptor::new(
            "a_very_long_partition",
            PartitionKind::SystemData,
            0,
            0x9000,
            0x1000,
        )]);
        assert!(matches!(
            serialize(&layout, TABLE_SIZE),
            Err(TableError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_capacity() {
        assert_eq!(entry_capacity(TABLE_SIZE), 95);
        let partitions = (0..96)
            .map(|i| PartitionDescriptor::ota(i, (i as u32) * 0x10000, 0x10000, None))
            .collect();
        let layout = PartitionLayout::from_partitions(partitions);
        assert_eq!(
            serialize(&layout, TABLE_SIZE),
            Err(TableError::TooManyEntries {
                count: 96,
                capacity: 95
            })
        );
        assert_eq!(
            serialize(&PartitionLayout::new(), 16),
            Err(TableError::BufferTooSmall(16))
        );
    }
}
