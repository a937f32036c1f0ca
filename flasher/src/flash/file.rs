// Licensed under the Apache-2.0 license

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::flash::hil::{check_erase_alignment, check_range, FlashDrvError, FlashStorage};

/// Flash device backed by an image file on the host.
pub struct FileFlash {
    file: Mutex<File>,
    capacity: usize,
    sector_size: usize,
}

impl FileFlash {
    /// Opens (or creates) the image at `path`. A file shorter than `capacity`
    /// is padded with erased bytes.
    pub fn open(path: &Path, capacity: usize, sector_size: usize) -> Result<Self, FlashDrvError> {
        if sector_size == 0 {
            return Err(FlashDrvError::Inval("sector size must be non-zero"));
        }
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len() as usize;
        if current < capacity {
            file.seek(SeekFrom::Start(current as u64))?;
            Self::fill_erased(&mut file, capacity - current)?;
        }
        debug!(
            "Opened flash image {} ({} bytes)",
            path.display(),
            capacity
        );

        Ok(Self {
            file: Mutex::new(file),
            capacity,
            sector_size,
        })
    }

    fn fill_erased(file: &mut File, mut remaining: usize) -> std::io::Result<()> {
        let chunk = vec![0xFF; 64 * 1024];
        while remaining > 0 {
            let write_size = remaining.min(chunk.len());
            file.write_all(&chunk[..write_size])?;
            remaining -= write_size;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FlashStorage for FileFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        check_range(address, buffer.len(), self.capacity)?;
        let mut file = self.lock();
        file.seek(SeekFrom::Start(address as u64))?;
        file.read_exact(buffer)?;
        Ok(())
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        check_range(address, buffer.len(), self.capacity)?;
        let mut file = self.lock();
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.write_all(buffer))?;
        Ok(())
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        check_erase_alignment(address, length, self.sector_size)?;
        check_range(address, length, self.capacity)?;
        let mut file = self.lock();
        file.seek(SeekFrom::Start(address as u64))?;
        Self::fill_erased(&mut file, length)?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }
}
