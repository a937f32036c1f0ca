// Licensed under the Apache-2.0 license

use partition_table::TableError;
use thiserror::Error;

use crate::allocator::AllocationError;
use crate::flash::FlashDrvError;
use crate::kv::KvError;
use crate::metadata::MetadataError;

#[derive(Error, Debug)]
pub enum FlasherError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("insufficient space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation aborted")]
    Aborted,
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Flash(#[from] FlashDrvError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<AllocationError> for FlasherError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::InsufficientSpace {
                required,
                available,
            } => FlasherError::InsufficientSpace {
                required,
                available,
            },
            other => FlasherError::InvalidArgument(other.to_string()),
        }
    }
}

/// Outcome of a flashing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlashResult {
    #[default]
    Success,
    InvalidFirmware,
    PartitionTableError,
    CrcMismatch,
    SpaceInsufficient,
    ReadFailed,
    WriteFailed,
    Aborted,
}

impl FlashResult {
    pub fn is_success(self) -> bool {
        self == FlashResult::Success
    }
}

impl std::fmt::Display for FlashResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FlashResult::Success => "success",
            FlashResult::InvalidFirmware => "invalid firmware",
            FlashResult::PartitionTableError => "partition table error",
            FlashResult::CrcMismatch => "checksum mismatch",
            FlashResult::SpaceInsufficient => "insufficient space",
            FlashResult::ReadFailed => "read failed",
            FlashResult::WriteFailed => "write failed",
            FlashResult::Aborted => "aborted",
        };
        f.write_str(text)
    }
}
