// Licensed under the Apache-2.0 license

//! Places the selected firmware images in OTA slots after the fixed system
//! partitions.
//!
//! Slots are carved contiguously from a single cursor that starts at the
//! first aligned address past the fixed partitions. Requests are placed
//! largest first and named `ota_<n>` in placement order. Holes are never
//! reused, so a batch either fits entirely or the whole plan fails.

use log::{debug, error, info};
use ota_config::{align_up, FlasherOptions, PlatformConfig};
use partition_table::{PartitionDescriptor, PartitionLayout, MAX_NAME_LEN};
use thiserror::Error;

use crate::catalog::{FirmwareCandidate, FirmwareCatalog};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("{required} bytes of OTA space required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("{requested} OTA partitions requested, at most {max} supported")]
    TooManyPartitions { requested: usize, max: usize },
    #[error("invalid allocation request: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Index of the candidate in the catalog.
    pub candidate: usize,
    pub min_size: u64,
    pub preferred_size: u64,
    /// Position in the selection; lower is higher priority.
    pub priority: usize,
}

pub struct PartitionAllocator<'a> {
    platform: &'a PlatformConfig,
    options: &'a FlasherOptions,
}

impl<'a> PartitionAllocator<'a> {
    pub fn new(platform: &'a PlatformConfig, options: &'a FlasherOptions) -> Self {
        Self { platform, options }
    }

    pub fn request_for(&self, candidate: usize, size: u64, priority: usize) -> AllocationRequest {
        let min_size = size + self.options.fixed_padding as u64;
        let preferred_size = align_up(min_size, self.platform.app_alignment as u64)
            .max(self.options.min_ota_size as u64);
        AllocationRequest {
            candidate,
            min_size,
            preferred_size,
            priority,
        }
    }

    /// Computes a layout for `selected` (indices into `candidates`, in
    /// selection order) without touching the candidates.
    pub fn plan(
        &self,
        fixed_partitions: &[PartitionDescriptor],
        candidates: &[FirmwareCandidate],
        selected: &[usize],
    ) -> Result<PartitionLayout, AllocationError> {
        if selected.len() > self.platform.max_ota_slots {
            return Err(AllocationError::TooManyPartitions {
                requested: selected.len(),
                max: self.platform.max_ota_slots,
            });
        }

        let mut requests = Vec::with_capacity(selected.len());
        for (priority, &index) in selected.iter().enumerate() {
            let candidate = candidates.get(index).ok_or_else(|| {
                AllocationError::InvalidArgument(format!("no candidate at index {index}"))
            })?;
            if selected[..priority].contains(&index) {
                return Err(AllocationError::InvalidArgument(format!(
                    "candidate {index} selected twice"
                )));
            }
            requests.push(self.request_for(index, candidate.size_bytes, priority));
        }
        // Stable, so equal sizes keep their selection order
        requests.sort_by(|a, b| b.preferred_size.cmp(&a.preferred_size));

        let mut layout = PartitionLayout::from_partitions(fixed_partitions.to_vec());
        let fixed_end = fixed_partitions.iter().map(|p| p.end()).max().unwrap_or(0);
        let start = align_up(fixed_end, self.platform.app_alignment as u64);
        let flash_size = self.platform.flash_size as u64;
        let available = flash_size.saturating_sub(start);
        let required: u64 = requests.iter().map(|r| r.preferred_size).sum();

        let mut cursor = start;
        for (slot, request) in requests.iter().enumerate() {
            if cursor + request.preferred_size > flash_size {
                error!(
                    "Firmware {} needs {:#x} bytes at {:#x}, flash ends at {:#x}",
                    request.candidate, request.preferred_size, cursor, flash_size
                );
                return Err(AllocationError::InsufficientSpace {
                    required,
                    available,
                });
            }
            debug!(
                "ota_{} at {:#x}, {:#x} bytes for candidate {} (min {:#x})",
                slot, cursor, request.preferred_size, request.candidate, request.min_size
            );
            layout.push(PartitionDescriptor::ota(
                slot,
                cursor as u32,
                request.preferred_size as u32,
                Some(request.candidate),
            ));
            cursor += request.preferred_size;
        }

        info!(
            "Planned {} OTA partitions, {:#x} of {:#x} bytes free",
            requests.len(),
            layout.remaining(flash_size),
            available
        );
        Ok(layout)
    }

    /// Plans a layout for the catalog's current selection and, on success,
    /// records each candidate's partition.
    pub fn generate_layout(
        &self,
        catalog: &mut FirmwareCatalog,
    ) -> Result<PartitionLayout, AllocationError> {
        let layout = self.plan(
            &self.platform.fixed_partitions,
            catalog.candidates(),
            &catalog.selected(),
        )?;
        catalog.apply_layout(&layout);
        Ok(layout)
    }

    /// Checks partition count, bounds, pairwise overlap and OTA slot sizing.
    /// Failures are logged. Sets and returns `layout.is_valid`.
    pub fn validate_layout(&self, layout: &mut PartitionLayout) -> bool {
        let mut valid = true;
        let flash_size = self.platform.flash_size as u64;
        let alignment = self.platform.app_alignment;
        if alignment == 0 {
            error!("Application alignment is zero");
            layout.is_valid = false;
            return false;
        }

        if layout.len() > self.platform.max_partitions {
            error!(
                "Layout has {} partitions, limit is {}",
                layout.len(),
                self.platform.max_partitions
            );
            valid = false;
        }

        for (i, partition) in layout.iter().enumerate() {
            if partition.name.is_empty() || partition.name.len() > MAX_NAME_LEN {
                error!("Partition {} has an invalid name '{}'", i, partition.name);
                valid = false;
            }
            if partition.end() > flash_size {
                error!(
                    "Partition {} [{:#x}, {:#x}) exceeds flash size {:#x}",
                    partition.name,
                    partition.offset,
                    partition.end(),
                    flash_size
                );
                valid = false;
            }
            if partition.is_ota {
                if partition.size < self.options.min_ota_size {
                    error!(
                        "OTA partition {} is {:#x} bytes, minimum is {:#x}",
                        partition.name, partition.size, self.options.min_ota_size
                    );
                    valid = false;
                }
                if partition.offset % alignment != 0 || partition.size % alignment != 0 {
                    error!(
                        "OTA partition {} is not aligned to {:#x}",
                        partition.name, alignment
                    );
                    valid = false;
                }
            }
            for other in layout.partitions[i + 1..].iter() {
                if partition.overlaps(other) {
                    error!("Partitions {} and {} overlap", partition.name, other.name);
                    valid = false;
                }
                if partition.name == other.name {
                    error!("Partition name {} is used twice", partition.name);
                    valid = false;
                }
            }
        }

        layout.is_valid = valid;
        valid
    }
}
