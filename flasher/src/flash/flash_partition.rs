// Licensed under the Apache-2.0 license

use partition_table::PartitionDescriptor;

use crate::flash::hil::{FlashDrvError, FlashStorage};

/// Represents a partition within the flash memory.
///
/// A `FlashPartition` provides a view into a contiguous region of the underlying
/// flash. Offsets passed to its operations are relative to the start of the
/// region and every access is checked against the region's length.
pub struct FlashPartition<'a> {
    driver: &'a dyn FlashStorage,
    name: &'a str,
    base_offset: usize,
    length: usize,
}

impl<'a> FlashPartition<'a> {
    /// Returns `Err(FlashDrvError::Size)` if the region does not fit the device.
    pub fn new(
        driver: &'a dyn FlashStorage,
        name: &'a str,
        base_offset: usize,
        length: usize,
    ) -> Result<Self, FlashDrvError> {
        match base_offset.checked_add(length) {
            Some(end) if end <= driver.capacity() => Ok(FlashPartition {
                driver,
                name,
                base_offset,
                length,
            }),
            _ => Err(FlashDrvError::Size {
                address: base_offset,
                length,
            }),
        }
    }

    /// View over the region described by a layout entry.
    pub fn from_descriptor(
        driver: &'a dyn FlashStorage,
        descriptor: &'a PartitionDescriptor,
    ) -> Result<Self, FlashDrvError> {
        Self::new(
            driver,
            &descriptor.name,
            descriptor.offset as usize,
            descriptor.size as usize,
        )
    }

    fn check(&self, partition_offset: usize, len: usize) -> Result<usize, FlashDrvError> {
        match partition_offset.checked_add(len) {
            Some(end) if end <= self.length => Ok(self.base_offset + partition_offset),
            _ => Err(FlashDrvError::Size {
                address: self.base_offset + partition_offset,
                length: len,
            }),
        }
    }

    pub fn read(&self, partition_offset: usize, buf: &mut [u8]) -> Result<(), FlashDrvError> {
        let address = self.check(partition_offset, buf.len())?;
        self.driver.read(buf, address)
    }

    pub fn write(&self, partition_offset: usize, buf: &[u8]) -> Result<(), FlashDrvError> {
        let address = self.check(partition_offset, buf.len())?;
        self.driver.write(buf, address)
    }

    pub fn erase(&self, partition_offset: usize, len: usize) -> Result<(), FlashDrvError> {
        let address = self.check(partition_offset, len)?;
        self.driver.erase(address, len)
    }

    /// Erases the whole region.
    pub fn erase_all(&self) -> Result<(), FlashDrvError> {
        self.driver.erase(self.base_offset, self.length)
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn name(&self) -> &str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    #[test]
    fn test_partition_bounds() {
        let flash = MemFlash::new(0x10000, 0x1000).unwrap();
        assert!(FlashPartition::new(&flash, "too_big", 0x8000, 0x9000).is_err());

        let partition = FlashPartition::new(&flash, "data", 0x4000, 0x2000).unwrap();
        assert_eq!(partition.name(), "data");
        assert_eq!(partition.len(), 0x2000);

        partition.erase(0, 0x1000).unwrap();
        partition.write(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            partition.write(0x1ffe, &[0; 4]),
            Err(FlashDrvError::Size {
                address: 0x5ffe,
                length: 4
            })
        );

        let mut buf = [0u8; 4];
        partition.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut raw = [0u8; 4];
        flash.read(&mut raw, 0x4010).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);
    }
}
