// Licensed under the Apache-2.0 license

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ota_config::{
    FlasherOptions, IMAGE_MAGIC, IMAGE_SEGMENT_COUNT_OFFSET, MAX_FIRMWARE_SIZE,
    MAX_IMAGE_SEGMENTS, MIN_FIRMWARE_SIZE,
};
use partition_table::PartitionLayout;

use crate::checksum::{checksum_file, ChecksumMode};
use crate::error::FlasherError;
use crate::kv::KvStore;
use crate::metadata::MetadataStore;

/// A firmware image found on the discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareCandidate {
    pub file_path: PathBuf,
    pub display_name: String,
    pub size_bytes: u64,
    /// Sampled checksum taken when the file was discovered.
    pub checksum: u32,
    pub is_structurally_valid: bool,
    pub is_selected: bool,
    /// Selection order; lower is selected earlier.
    pub priority: Option<u64>,
    /// Index into the layout's partitions once allocation has placed this image.
    pub assigned_partition: Option<usize>,
}

impl FirmwareCandidate {
    pub fn from_file(path: &Path, options: &FlasherOptions) -> Result<Self, FlasherError> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlasherError::NotFound(path.display().to_string()),
            _ => FlasherError::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(FlasherError::InvalidArgument(format!(
                "{} is not a file",
                path.display()
            )));
        }

        let size_bytes = metadata.len();
        let mode = ChecksumMode::Sampled {
            window: options.sample_window as u64,
        };
        let checksum = checksum_file(path, mode)?;
        let display_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut candidate = Self {
            file_path: path.to_path_buf(),
            display_name,
            size_bytes,
            checksum,
            is_structurally_valid: size_in_range(size_bytes),
            is_selected: false,
            priority: None,
            assigned_partition: None,
        };
        if options.full_validation && candidate.is_structurally_valid {
            candidate.is_structurally_valid = header_is_valid(path)?;
        }
        debug!(
            "Discovered {} ({} bytes, crc {:08x}, valid {})",
            candidate.display_name,
            candidate.size_bytes,
            candidate.checksum,
            candidate.is_structurally_valid
        );
        Ok(candidate)
    }
}

fn size_in_range(size: u64) -> bool {
    (MIN_FIRMWARE_SIZE..=MAX_FIRMWARE_SIZE).contains(&size)
}

/// Checks the image magic and that the header's segment count is sane.
fn header_is_valid(path: &Path) -> Result<bool, FlasherError> {
    let mut header = [0u8; IMAGE_SEGMENT_COUNT_OFFSET + 1];
    let mut file = File::open(path)?;
    if file.read_exact(&mut header).is_err() {
        return Ok(false);
    }
    let segments = header[IMAGE_SEGMENT_COUNT_OFFSET];
    Ok(header[0] == IMAGE_MAGIC && (1..=MAX_IMAGE_SEGMENTS).contains(&segments))
}

/// Candidates discovered under one directory. Rebuilt on every rescan.
pub struct FirmwareCatalog {
    options: FlasherOptions,
    root: Option<PathBuf>,
    candidates: Vec<FirmwareCandidate>,
    next_priority: u64,
}

impl FirmwareCatalog {
    pub fn new(options: &FlasherOptions) -> Self {
        Self {
            options: options.clone(),
            root: None,
            candidates: Vec::new(),
            next_priority: 0,
        }
    }

    /// Walks `dir` recursively and replaces the catalog with every file whose
    /// extension is accepted, ordered by path. Files that can't be read are skipped.
    pub fn scan(&mut self, dir: &Path) -> Result<usize, FlasherError> {
        if !dir.is_dir() {
            return Err(FlasherError::NotFound(dir.display().to_string()));
        }

        let mut paths = vec![];
        for entry in walkdir::WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(Some(extension)) = entry.path().extension().map(|s| s.to_str()) {
                if self.options.accepts_extension(extension) {
                    paths.push(entry.path().to_path_buf());
                }
            }
        }
        paths.sort();

        self.candidates.clear();
        self.next_priority = 0;
        for path in paths {
            match FirmwareCandidate::from_file(&path, &self.options) {
                Ok(candidate) => self.candidates.push(candidate),
                Err(err) => warn!("Skipping {}: {}", path.display(), err),
            }
        }
        self.root = Some(dir.to_path_buf());
        info!(
            "Found {} firmware candidates in {}",
            self.candidates.len(),
            dir.display()
        );
        Ok(self.candidates.len())
    }

    /// Scans the last scanned directory again and forgets every record of
    /// previously flashed firmware.
    pub fn rescan<K: KvStore>(
        &mut self,
        metadata: &mut MetadataStore<K>,
    ) -> Result<usize, FlasherError> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| FlasherError::InvalidState("catalog was never scanned".to_string()))?;
        let count = self.scan(&root)?;
        metadata.clear_all()?;
        Ok(count)
    }

    /// Adds a single file outside of a directory scan.
    pub fn add_file(&mut self, path: &Path) -> Result<usize, FlasherError> {
        let candidate = FirmwareCandidate::from_file(path, &self.options)?;
        self.candidates.push(candidate);
        Ok(self.candidates.len() - 1)
    }

    fn candidate_mut(&mut self, index: usize) -> Result<&mut FirmwareCandidate, FlasherError> {
        let len = self.candidates.len();
        self.candidates.get_mut(index).ok_or_else(|| {
            FlasherError::InvalidArgument(format!(
                "candidate index {index} out of range ({len} candidates)"
            ))
        })
    }

    pub fn select(&mut self, index: usize, selected: bool) -> Result<(), FlasherError> {
        let priority = self.next_priority;
        let candidate = self.candidate_mut(index)?;
        if candidate.is_selected == selected {
            return Ok(());
        }
        candidate.is_selected = selected;
        if selected {
            candidate.priority = Some(priority);
            self.next_priority += 1;
        } else {
            candidate.priority = None;
            candidate.assigned_partition = None;
        }
        Ok(())
    }

    /// Flips the selection of one candidate and returns the new state.
    pub fn toggle(&mut self, index: usize) -> Result<bool, FlasherError> {
        let selected = !self.candidate_mut(index)?.is_selected;
        self.select(index, selected)?;
        Ok(selected)
    }

    /// Indices of the selected candidates in the order they were selected.
    pub fn selected(&self) -> Vec<usize> {
        let mut selected: Vec<usize> = (0..self.candidates.len())
            .filter(|&i| self.candidates[i].is_selected)
            .collect();
        selected.sort_by_key(|&i| self.candidates[i].priority);
        selected
    }

    pub fn total_selected_size(&self) -> u64 {
        self.candidates
            .iter()
            .filter(|c| c.is_selected)
            .map(|c| c.size_bytes)
            .sum()
    }

    /// Re-checks the size bounds and the image header of one candidate.
    pub fn validate_full(&mut self, index: usize) -> Result<bool, FlasherError> {
        let candidate = self.candidate_mut(index)?;
        let valid =
            size_in_range(candidate.size_bytes) && header_is_valid(&candidate.file_path)?;
        candidate.is_structurally_valid = valid;
        Ok(valid)
    }

    /// Records which partition every candidate was placed in. Candidates that
    /// are not referenced by the layout lose their assignment.
    pub fn apply_layout(&mut self, layout: &PartitionLayout) {
        for candidate in self.candidates.iter_mut() {
            candidate.assigned_partition = None;
        }
        for (partition_index, descriptor) in layout.iter().enumerate() {
            let Some(index) = descriptor.firmware else {
                continue;
            };
            if let Some(candidate) = self.candidates.get_mut(index) {
                candidate.assigned_partition = Some(partition_index);
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&FirmwareCandidate> {
        self.candidates.get(index)
    }

    pub fn candidates(&self) -> &[FirmwareCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn options(&self) -> &FlasherOptions {
        &self.options
    }
}
