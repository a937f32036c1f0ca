// Licensed under the Apache-2.0 license

pub mod file;
pub mod flash_partition;
pub mod hil;
pub mod memory;

pub use file::FileFlash;
pub use flash_partition::FlashPartition;
pub use hil::{FlashDrvError, FlashStorage};
pub use memory::MemFlash;
