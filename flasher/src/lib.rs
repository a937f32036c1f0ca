// Licensed under the Apache-2.0 license

//! Partition allocation and firmware flashing for a single shared flash chip.
//!
//! The flow is: scan a directory into a [`FirmwareCatalog`], select images,
//! then hand the catalog to a [`FlashEngine`]. The engine plans the OTA slots
//! with the [`PartitionAllocator`], writes the partition table, streams each
//! image into its slot, verifies it and records the result in the
//! [`MetadataStore`].

pub mod allocator;
pub mod catalog;
pub mod checksum;
pub mod engine;
mod error;
pub mod flash;
pub mod kv;
pub mod metadata;

pub use allocator::{AllocationError, AllocationRequest, PartitionAllocator};
pub use catalog::{FirmwareCandidate, FirmwareCatalog};
pub use checksum::{crc32, ChecksumMode};
pub use engine::{
    ChannelObserver, FlashEngine, FlashEvent, FlashObserver, FlashOperationState, FlashSession,
    FlashStatistics, ProgressEvent, StatusEvent,
};
pub use error::{FlashResult, FlasherError};
pub use flash::{FileFlash, FlashDrvError, FlashPartition, FlashStorage, MemFlash};
pub use kv::{JsonFileKvStore, KvError, KvStore, KvValue, MemoryKvStore};
pub use metadata::{FirmwareMetadataRecord, MetadataError, MetadataStore};
pub use ota_config::{FlasherConfig, FlasherOptions, PlatformConfig};
pub use partition_table::{PartitionDescriptor, PartitionKind, PartitionLayout};
