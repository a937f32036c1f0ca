// Licensed under the Apache-2.0 license

use std::fs::File;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use ota_config::{FlasherConfig, PlatformConfig};
use partition_table::{PartitionDescriptor, PartitionLayout};

use crate::allocator::{AllocationError, PartitionAllocator};
use crate::catalog::FirmwareCandidate;
use crate::checksum::{checksum_flash, ChecksumMode};
use crate::engine::chunk::{calculate_chunk_size, patch_truncated_header};
use crate::engine::events::{FlashObserver, ProgressEvent, StatusEvent};
use crate::engine::flash_sm::{Events, FlashOperationState};
use crate::engine::stats::percent;
use crate::engine::{lock, Shared};
use crate::error::{FlashResult, FlasherError};
use crate::flash::{FlashPartition, FlashStorage};
use crate::kv::KvStore;
use crate::metadata::{FirmwareMetadataRecord, MetadataStore};

/// A fatal error together with the result it ends the run with.
pub(crate) struct Failure {
    result: FlashResult,
    error: FlasherError,
}

trait OrFail<T> {
    fn or_fail(self, result: FlashResult) -> Result<T, Failure>;
}

impl<T, E: Into<FlasherError>> OrFail<T> for Result<T, E> {
    fn or_fail(self, result: FlashResult) -> Result<T, Failure> {
        self.map_err(|e| {
            let error = e.into();
            let result = match error {
                FlasherError::Aborted => FlashResult::Aborted,
                _ => result,
            };
            Failure { result, error }
        })
    }
}

/// One image written to its slot.
struct FlashedImage<'a> {
    candidate: &'a FirmwareCandidate,
    partition: &'a PartitionDescriptor,
    verified: bool,
}

/// Erases the table region, writes `table` and compares the first
/// `verify_len` bytes read back.
pub(crate) fn write_table_region(
    flash: &dyn FlashStorage,
    platform: &PlatformConfig,
    table: &[u8],
    verify_len: usize,
) -> Result<(), FlasherError> {
    let region = FlashPartition::new(
        flash,
        "partition_table",
        platform.table_offset as usize,
        platform.table_erase_len() as usize,
    )?;
    region.erase_all()?;
    region.write(0, table)?;

    let verify_len = verify_len.min(table.len());
    let mut readback = vec![0u8; verify_len];
    region.read(0, &mut readback)?;
    if readback != table[..verify_len] {
        return Err(FlasherError::IntegrityMismatch(format!(
            "partition table read-back differs in the first {verify_len} bytes"
        )));
    }
    Ok(())
}

pub(crate) struct Worker<F: FlashStorage, K: KvStore> {
    pub config: Arc<FlasherConfig>,
    pub flash: Arc<F>,
    pub metadata: Arc<Mutex<MetadataStore<K>>>,
    pub observer: Arc<dyn FlashObserver>,
    pub shared: Arc<Mutex<Shared>>,
    pub abort: Arc<AtomicBool>,
    pub candidates: Vec<FirmwareCandidate>,
    /// Candidate indices in selection order.
    pub selected: Vec<usize>,
}

impl<F: FlashStorage, K: KvStore> Worker<F, K> {
    pub fn run(self) -> FlashResult {
        // A panic in a phase (or in a storage backend) still ends the run in `Error`
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(Ok(())) => FlashResult::Success,
            Ok(Err(failure)) => self.fail(failure),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.fail(Failure {
                    result: FlashResult::WriteFailed,
                    error: FlasherError::InvalidState(format!("flash worker panicked: {reason}")),
                })
            }
        }
    }

    fn execute(&self) -> Result<(), Failure> {
        self.status(
            FlashOperationState::Initializing,
            FlashResult::Success,
            Level::Info,
            format!("Initializing ({} images)", self.selected.len()),
        );
        self.initialize()?;
        self.advance(Events::SnapshotTaken)?;

        self.back_up();
        self.advance(Events::BackupFinished)?;

        let layout = self.write_table()?;
        self.advance(Events::TableWritten)?;

        let mut flashed = self.flash_firmware(&layout)?;
        self.advance(Events::FirmwareFlashed)?;

        self.verify(&mut flashed)?;
        self.advance(Events::VerificationFinished)?;

        self.complete(&flashed);
        Ok(())
    }

    fn advance(&self, event: Events) -> Result<(), Failure> {
        let state = {
            let mut shared = lock(&self.shared);
            shared
                .sm
                .process_event(event.clone())
                .map_err(|e| Failure {
                    result: FlashResult::WriteFailed,
                    error: FlasherError::InvalidState(format!("{event:?} rejected: {e:?}")),
                })?;
            shared.state()
        };
        debug!("Flash engine entered {:?}", state);
        // The terminal notification is sent once the run has been recorded
        if state != FlashOperationState::Completed {
            self.status(state, FlashResult::Success, Level::Info, format!("{state:?}"));
        }
        Ok(())
    }

    fn status(&self, state: FlashOperationState, result: FlashResult, level: Level, message: String) {
        self.observer.on_status(&StatusEvent {
            state,
            result,
            level,
            message,
        });
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    fn initialize(&self) -> Result<(), Failure> {
        let mut total_bytes = 0;
        for &index in &self.selected {
            let candidate = self.candidates.get(index).ok_or_else(|| Failure {
                result: FlashResult::InvalidFirmware,
                error: FlasherError::InvalidArgument(format!("no candidate at index {index}")),
            })?;
            if !candidate.is_structurally_valid {
                error!("{} is not a valid firmware image", candidate.display_name);
                return Err(Failure {
                    result: FlashResult::InvalidFirmware,
                    error: FlasherError::InvalidArgument(format!(
                        "{} is not a valid firmware image",
                        candidate.file_path.display()
                    )),
                });
            }
            total_bytes += candidate.size_bytes;
        }

        lock(&self.shared)
            .stats
            .begin(self.selected.len(), total_bytes);
        info!(
            "Flashing {} images, {} bytes",
            self.selected.len(),
            total_bytes
        );
        Ok(())
    }

    /// Keeps a copy of the current table region. Failure only costs the backup.
    fn back_up(&self) {
        let platform = &self.config.platform;
        let mut backup = vec![0u8; platform.table_size as usize];
        if let Err(e) = self.flash.read(&mut backup, platform.table_offset as usize) {
            warn!("Could not back up the partition table, continuing without one: {}", e);
            lock(&self.shared).backup = None;
            return;
        }

        match partition_table::deserialize(&backup) {
            Ok(layout) if !layout.is_empty() => {
                info!("Backed up existing table with {} partitions", layout.len())
            }
            Ok(_) => info!("No partition table on flash, treating as first run"),
            Err(e) => warn!("Existing partition table is unreadable: {}", e),
        }
        lock(&self.shared).backup = Some(backup);
    }

    fn write_table(&self) -> Result<PartitionLayout, Failure> {
        let platform = &self.config.platform;
        let options = &self.config.options;
        let allocator = PartitionAllocator::new(platform, options);

        let mut layout = allocator
            .plan(&platform.fixed_partitions, &self.candidates, &self.selected)
            .map_err(|e| {
                let result = match e {
                    AllocationError::InsufficientSpace { .. } => FlashResult::SpaceInsufficient,
                    _ => FlashResult::PartitionTableError,
                };
                Failure {
                    result,
                    error: e.into(),
                }
            })?;
        if !allocator.validate_layout(&mut layout) {
            return Err(Failure {
                result: FlashResult::PartitionTableError,
                error: FlasherError::InvalidArgument("layout failed validation".to_string()),
            });
        }

        let table = partition_table::serialize(&layout, platform.table_size as usize)
            .or_fail(FlashResult::PartitionTableError)?;
        write_table_region(
            &*self.flash,
            platform,
            &table,
            options.verify_table_prefix,
        )
        .map_err(|e| {
            let result = match e {
                FlasherError::IntegrityMismatch(_) => FlashResult::PartitionTableError,
                _ => FlashResult::WriteFailed,
            };
            Failure { result, error: e }
        })?;
        info!(
            "Wrote partition table with {} entries at {:#x}",
            layout.len(),
            platform.table_offset
        );

        {
            // Truncated images only write as much as their slot holds
            let mut shared = lock(&self.shared);
            shared.stats.total_bytes = layout
                .ota_partitions()
                .filter_map(|p| {
                    let candidate = self.candidates.get(p.firmware?)?;
                    Some(candidate.size_bytes.min(p.size as u64))
                })
                .sum();
            shared.layout = Some(layout.clone());
        }
        Ok(layout)
    }

    fn flash_firmware<'a>(
        &'a self,
        layout: &'a PartitionLayout,
    ) -> Result<Vec<FlashedImage<'a>>, Failure> {
        let slots: Vec<(&PartitionDescriptor, &FirmwareCandidate)> = layout
            .ota_partitions()
            .filter_map(|p| Some((p, self.candidates.get(p.firmware?)?)))
            .collect();

        let mut flashed = Vec::with_capacity(slots.len());
        for (position, &(partition, candidate)) in slots.iter().enumerate() {
            if self.aborted() {
                return Err(Failure {
                    result: FlashResult::Aborted,
                    error: FlasherError::Aborted,
                });
            }
            self.flash_one(position, slots.len(), partition, candidate)?;
            lock(&self.shared).stats.completed_firmwares += 1;
            flashed.push(FlashedImage {
                candidate,
                partition,
                verified: false,
            });
        }
        Ok(flashed)
    }

    fn flash_one(
        &self,
        position: usize,
        total: usize,
        partition: &PartitionDescriptor,
        candidate: &FirmwareCandidate,
    ) -> Result<(), Failure> {
        let region =
            FlashPartition::from_descriptor(&*self.flash, partition).or_fail(FlashResult::WriteFailed)?;
        region.erase_all().or_fail(FlashResult::WriteFailed)?;

        let mut file = open_firmware(&candidate.file_path).or_fail(FlashResult::ReadFailed)?;
        // The file may have changed since discovery; its current length is what gets written
        let file_len = file
            .metadata()
            .map(|m| m.len())
            .or_fail(FlashResult::ReadFailed)?;
        let write_len = file_len.min(partition.size as u64);
        let truncated = file_len > write_len;
        if truncated {
            warn!(
                "{} is {} bytes, truncating to the {} bytes of {}",
                candidate.display_name, file_len, write_len, partition.name
            );
            lock(&self.shared).stats.truncated_firmwares += 1;
        }
        info!(
            "Writing {} to {} at {:#x}",
            candidate.display_name, partition.name, partition.offset
        );

        let chunk_size = calculate_chunk_size(file_len, partition.is_ota);
        let granularity = (self.config.options.progress_granularity as u64).max(1);
        let mut buffer = vec![0u8; chunk_size];
        let mut offset = 0u64;

        while offset < write_len {
            if self.aborted() {
                warn!(
                    "Aborted while writing {} at offset {:#x}",
                    candidate.display_name, offset
                );
                return Err(Failure {
                    result: FlashResult::Aborted,
                    error: FlasherError::Aborted,
                });
            }

            let n = (write_len - offset).min(chunk_size as u64) as usize;
            file.read_exact(&mut buffer[..n])
                .or_fail(FlashResult::ReadFailed)?;
            if offset == 0 && truncated && patch_truncated_header(&mut buffer[..n]) {
                debug!("Cleared image hash flag of {}", candidate.display_name);
            }
            region
                .write(offset as usize, &buffer[..n])
                .or_fail(FlashResult::WriteFailed)?;

            let previous = offset;
            offset += n as u64;
            let total_percent = {
                let mut shared = lock(&self.shared);
                shared.stats.written_bytes += n as u64;
                shared.stats.percent_written()
            };
            if previous / granularity != offset / granularity || offset == write_len {
                self.observer.on_progress(&ProgressEvent {
                    current_index: position,
                    total,
                    current_percent: percent(offset, write_len),
                    total_percent,
                    message: if offset == write_len {
                        format!("Flashed {} to {}", candidate.display_name, partition.name)
                    } else {
                        format!("Writing {}", candidate.display_name)
                    },
                });
            }
        }
        Ok(())
    }

    /// Recomputes each image's sampled checksum from flash. A mismatch is
    /// reported as a warning and does not fail the run.
    fn verify(&self, flashed: &mut [FlashedImage]) -> Result<(), Failure> {
        let window = self.config.options.sample_window as u64;
        let capacity = self.flash.capacity() as u64;

        for image in flashed.iter_mut() {
            let offset = image.partition.offset as u64;
            // Bounded by the original image size, not the slot
            let len = image
                .candidate
                .size_bytes
                .min(capacity.saturating_sub(offset));
            let crc = checksum_flash(
                &*self.flash,
                offset as usize,
                len,
                ChecksumMode::Sampled { window },
                calculate_chunk_size(len, image.partition.is_ota),
                &self.abort,
            )
            .or_fail(FlashResult::ReadFailed)?;

            image.verified = crc == image.candidate.checksum;
            if image.verified {
                debug!("{} verified ({:08x})", image.partition.name, crc);
                continue;
            }

            let message = format!(
                "Checksum of {} in {} is {:08x}, expected {:08x}",
                image.candidate.display_name, image.partition.name, crc, image.candidate.checksum
            );
            warn!("{}", message);
            lock(&self.shared).stats.verify_warnings += 1;
            self.status(
                FlashOperationState::Verifying,
                FlashResult::Success,
                Level::Warn,
                message,
            );
        }
        Ok(())
    }

    fn complete(&self, flashed: &[FlashedImage]) {
        let stats = {
            let mut shared = lock(&self.shared);
            shared.stats.finish();
            shared.stats.clone()
        };

        let timestamp = Utc::now().timestamp();
        {
            let mut metadata = lock(&self.metadata);
            for image in flashed {
                let record = FirmwareMetadataRecord {
                    filename: image
                        .candidate
                        .file_path
                        .file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| image.candidate.display_name.clone()),
                    partition_name: image.partition.name.clone(),
                    offset: image.partition.offset,
                    size: image.partition.size,
                    checksum: image.candidate.checksum,
                    is_valid: image.verified,
                    timestamp,
                };
                if let Err(e) = metadata.upsert(&record) {
                    warn!(
                        "Could not record {} in {}: {}",
                        record.filename, record.partition_name, e
                    );
                }
            }
        }

        info!(
            "Flashed {} images, {} bytes in {} ms ({} B/s), {} verification warnings",
            stats.completed_firmwares,
            stats.written_bytes,
            stats.elapsed_ms,
            stats.throughput,
            stats.verify_warnings
        );
        self.status(
            FlashOperationState::Completed,
            FlashResult::Success,
            Level::Info,
            format!("Flashed {} images", stats.completed_firmwares),
        );

        let mut shared = lock(&self.shared);
        shared.result = FlashResult::Success;
        if let Err(e) = shared.sm.process_event(Events::Reset) {
            error!("Could not return to idle: {:?}", e);
        }
    }

    fn fail(&self, failure: Failure) -> FlashResult {
        let Failure { result, error } = failure;
        error!("Flash run failed ({}): {}", result, error);
        {
            let mut shared = lock(&self.shared);
            shared.result = result;
            shared.stats.error_count += 1;
            shared.stats.finish();
            if let Err(e) = shared.sm.process_event(Events::Fail) {
                error!("Could not enter the error state: {:?}", e);
            }
        }
        self.status(
            FlashOperationState::Error,
            result,
            Level::Error,
            error.to_string(),
        );
        result
    }
}

fn open_firmware(path: &Path) -> Result<File, FlasherError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FlasherError::NotFound(path.display().to_string()),
        _ => FlasherError::Io(e),
    })
}
