// Licensed under the Apache-2.0 license

//! Generic interface for raw flash access.

use thiserror::Error;

/// Reads, writes and erases arbitrary ranges of a flash device. All addresses are
/// absolute. Writes are not atomic and a range must be erased before it is
/// programmed again.
pub trait FlashStorage {
    /// Read from the flash storage, filling the provided buffer with data
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError>;

    /// Write to the flash storage with the full contents of the buffer, starting at the specified address
    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError>;

    /// Erase `length` bytes starting at address `address`. Both must be multiples
    /// of the erase granularity.
    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError>;

    /// Returns the size of the flash storage in bytes.
    fn capacity(&self) -> usize;

    /// Erase granularity in bytes.
    fn sector_size(&self) -> usize;
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum FlashDrvError {
    /// Generic failure condition
    #[error("flash operation failed")]
    Fail,
    /// An invalid parameter was passed
    #[error("invalid flash parameter: {0}")]
    Inval(&'static str),
    /// Access past the end of the device or region
    #[error("access of {length} bytes at {address:#x} is out of range")]
    Size { address: usize, length: usize },
    /// Programming would need to set bits that are not erased
    #[error("flash at {address:#x} is not erased")]
    NotErased { address: usize },
    #[error("flash backend I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FlashDrvError {
    fn from(err: std::io::Error) -> Self {
        FlashDrvError::Io(err.to_string())
    }
}

/// Bounds check shared by the backends.
pub(crate) fn check_range(
    address: usize,
    length: usize,
    capacity: usize,
) -> Result<(), FlashDrvError> {
    match address.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(FlashDrvError::Size { address, length }),
    }
}

/// Alignment check for erase requests.
pub(crate) fn check_erase_alignment(
    address: usize,
    length: usize,
    sector_size: usize,
) -> Result<(), FlashDrvError> {
    if sector_size == 0 {
        return Err(FlashDrvError::Inval("sector size must be non-zero"));
    }
    if address % sector_size != 0 || length % sector_size != 0 {
        return Err(FlashDrvError::Inval("erase range is not sector aligned"));
    }
    Ok(())
}
