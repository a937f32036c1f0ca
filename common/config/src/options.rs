// Licensed under the Apache-2.0 license

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{PlatformConfig, KIB, PARTITION_TABLE_SIZE};

pub const DEFAULT_FIXED_PADDING: u32 = 4 * KIB;
pub const DEFAULT_MIN_OTA_SIZE: u32 = 256 * KIB;
pub const DEFAULT_PROGRESS_GRANULARITY: u32 = 64 * KIB;
pub const DEFAULT_SAMPLE_WINDOW: u32 = 4 * KIB;
pub const DEFAULT_METADATA_NAMESPACE: &str = "fw_meta";
pub const DEFAULT_TABLE_VERIFY_PREFIX: usize = PARTITION_TABLE_SIZE as usize;

/// Tunables of the allocator and the flashing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherOptions {
    /// Headroom added to every image before its slot is sized.
    pub fixed_padding: u32,
    /// Smallest OTA slot that will be allocated.
    pub min_ota_size: u32,
    /// Bytes between two progress notifications.
    pub progress_granularity: u32,
    /// Head and tail window hashed by the sampled CRC.
    pub sample_window: u32,
    /// Also check the image magic byte and segment count at discovery.
    pub full_validation: bool,
    pub firmware_extensions: Vec<String>,
    pub metadata_namespace: String,
    /// Number of bytes of the written table read back and compared. Clamped to
    /// the serialized table length.
    pub verify_table_prefix: usize,
}

impl Default for FlasherOptions {
    fn default() -> Self {
        FlasherOptions {
            fixed_padding: DEFAULT_FIXED_PADDING,
            min_ota_size: DEFAULT_MIN_OTA_SIZE,
            progress_granularity: DEFAULT_PROGRESS_GRANULARITY,
            sample_window: DEFAULT_SAMPLE_WINDOW,
            full_validation: false,
            firmware_extensions: vec!["bin".to_string()],
            metadata_namespace: DEFAULT_METADATA_NAMESPACE.to_string(),
            verify_table_prefix: DEFAULT_TABLE_VERIFY_PREFIX,
        }
    }
}

impl FlasherOptions {
    pub fn validate(&self) -> Result<()> {
        if self.progress_granularity == 0 {
            bail!("Progress granularity must be non-zero");
        }
        if self.sample_window == 0 {
            bail!("Sample window must be non-zero");
        }
        if self.verify_table_prefix == 0 {
            bail!("Partition table read-back length must be non-zero");
        }
        if self.firmware_extensions.is_empty() {
            bail!("At least one firmware file extension is required");
        }
        if self.metadata_namespace.is_empty() {
            bail!("Metadata namespace must not be empty");
        }
        Ok(())
    }

    /// Case-insensitive match of a file extension against the configured list.
    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.firmware_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub platform: PlatformConfig,
    pub options: FlasherOptions,
}

impl FlasherConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: FlasherConfig = toml::from_str(text)?;
        config.platform.validate()?;
        config.options.validate()?;
        Ok(config)
    }
}

/// Loads a configuration file. Sections and keys that are absent keep their defaults.
pub fn load_config(path: &Path) -> Result<FlasherConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = FlasherConfig::from_toml(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    debug!("Loaded flasher config from {}", path.display());
    Ok(config)
}
