// Licensed under the Apache-2.0 license

use std::sync::{Mutex, MutexGuard};

use crate::flash::hil::{check_erase_alignment, check_range, FlashDrvError, FlashStorage};

/// NOR-like flash held in memory. Starts fully erased; programming can only
/// clear bits, so rewriting a range requires erasing it first.
pub struct MemFlash {
    data: Mutex<Vec<u8>>,
    sector_size: usize,
}

impl MemFlash {
    pub fn new(capacity: usize, sector_size: usize) -> Result<Self, FlashDrvError> {
        if sector_size == 0 {
            return Err(FlashDrvError::Inval("sector size must be non-zero"));
        }
        Ok(Self {
            data: Mutex::new(vec![0xFF; capacity]),
            sector_size,
        })
    }

    /// Builds a device preloaded with `content`; the rest reads as erased.
    pub fn with_content(
        capacity: usize,
        sector_size: usize,
        content: &[u8],
    ) -> Result<Self, FlashDrvError> {
        let flash = Self::new(capacity, sector_size)?;
        {
            let mut data = flash.lock();
            let len = content.len().min(capacity);
            data[..len].copy_from_slice(&content[..len]);
        }
        Ok(flash)
    }

    /// Copy of the whole device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FlashStorage for MemFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        let data = self.lock();
        check_range(address, buffer.len(), data.len())?;
        buffer.copy_from_slice(&data[address..address + buffer.len()]);
        Ok(())
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        let mut data = self.lock();
        check_range(address, buffer.len(), data.len())?;
        let target = &mut data[address..address + buffer.len()];
        if let Some(pos) = target
            .iter()
            .zip(buffer)
            .position(|(old, new)| new & !old != 0)
        {
            return Err(FlashDrvError::NotErased {
                address: address + pos,
            });
        }
        for (old, new) in target.iter_mut().zip(buffer) {
            *old &= *new;
        }
        Ok(())
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        check_erase_alignment(address, length, self.sector_size)?;
        let mut data = self.lock();
        check_range(address, length, data.len())?;
        data[address..address + length].fill(0xFF);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.lock().len()
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_erase() {
        let flash = MemFlash::new(0x4000, 0x1000).unwrap();
        flash.write(&[0x12, 0x34], 0x100).unwrap();
        assert_eq!(
            flash.write(&[0x12, 0x35], 0x100),
            Err(FlashDrvError::NotErased { address: 0x101 })
        );
        // Clearing further bits is allowed
        flash.write(&[0x02, 0x34], 0x100).unwrap();

        flash.erase(0, 0x1000).unwrap();
        flash.write(&[0xAB, 0xCD], 0x100).unwrap();
        let mut buf = [0u8; 2];
        flash.read(&mut buf, 0x100).unwrap();
        assert_eq!(buf, [0xAB, 0xCD]);
    }

    #[test]
    fn test_erase_alignment_and_bounds() {
        let flash = MemFlash::new(0x4000, 0x1000).unwrap();
        assert!(matches!(
            flash.erase(0x800, 0x1000),
            Err(FlashDrvError::Inval(_))
        ));
        assert!(matches!(
            flash.erase(0x3000, 0x2000),
            Err(FlashDrvError::Size { .. })
        ));
        let mut buf = [0u8; 4];
        assert!(flash.read(&mut buf, 0x3ffe).is_err());
    }

    #[test]
    fn test_zero_sector_size_rejected() {
        assert!(matches!(MemFlash::new(0x4000, 0), Err(FlashDrvError::Inval(_))));
    }

    #[test]
    fn test_with_content() {
        let flash = MemFlash::with_content(0x2000, 0x1000, &[1, 2, 3]).unwrap();
        let snapshot = flash.snapshot();
        assert_eq!(&snapshot[..4], &[1, 2, 3, 0xFF]);
        assert_eq!(flash.capacity(), 0x2000);
    }
}
