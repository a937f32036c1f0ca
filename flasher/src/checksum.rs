// Licensed under the Apache-2.0 license

//! CRC-32 (IEEE 802.3) over files and flash regions, either over the whole
//! input or sampled over its head and tail windows.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crc32fast::Hasher;

use crate::error::FlasherError;
use crate::flash::FlashStorage;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Full,
    /// Only the first and last `window` bytes are hashed once the input is
    /// larger than two windows. A match is not proof of integrity.
    Sampled { window: u64 },
}

impl ChecksumMode {
    /// Byte ranges hashed for an input of `len` bytes, in order.
    pub fn ranges(self, len: u64) -> Vec<(u64, u64)> {
        match self {
            ChecksumMode::Sampled { window } if window > 0 && len > 2 * window => {
                vec![(0, window), (len - window, window)]
            }
            _ => vec![(0, len)],
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn crc32_with_mode(data: &[u8], mode: ChecksumMode) -> u32 {
    let mut hasher = Hasher::new();
    for (start, len) in mode.ranges(data.len() as u64) {
        hasher.update(&data[start as usize..(start + len) as usize]);
    }
    hasher.finalize()
}

/// Checksum of the first `len` bytes readable from `reader`.
pub fn checksum_reader<R: Read + Seek>(
    reader: &mut R,
    len: u64,
    mode: ChecksumMode,
) -> std::io::Result<u32> {
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; READ_CHUNK];
    for (start, range_len) in mode.ranges(len) {
        reader.seek(SeekFrom::Start(start))?;
        let mut remaining = range_len;
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK as u64) as usize;
            reader.read_exact(&mut buffer[..n])?;
            hasher.update(&buffer[..n]);
            remaining -= n as u64;
        }
    }
    Ok(hasher.finalize())
}

pub fn checksum_file(path: &Path, mode: ChecksumMode) -> Result<u32, FlasherError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FlasherError::NotFound(path.display().to_string()),
        _ => FlasherError::Io(e),
    })?;
    let len = file.metadata()?.len();
    Ok(checksum_reader(&mut file, len, mode)?)
}

/// Checksum of `len` bytes of flash starting at `address`. `abort` is polled
/// before every chunk read.
pub fn checksum_flash(
    flash: &dyn FlashStorage,
    address: usize,
    len: u64,
    mode: ChecksumMode,
    chunk_size: usize,
    abort: &AtomicBool,
) -> Result<u32, FlasherError> {
    if chunk_size == 0 {
        return Err(FlasherError::InvalidArgument(
            "checksum chunk size is zero".to_string(),
        ));
    }
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; chunk_size];
    for (start, range_len) in mode.ranges(len) {
        let mut done = 0u64;
        while done < range_len {
            if abort.load(Ordering::Relaxed) {
                return Err(FlasherError::Aborted);
            }
            let n = (range_len - done).min(chunk_size as u64) as usize;
            flash.read(&mut buffer[..n], address + (start + done) as usize)?;
            hasher.update(&buffer[..n]);
            done += n as u64;
        }
    }
    Ok(hasher.finalize())
}
