// Licensed under the Apache-2.0 license

//! Background flashing of the selected firmware images.
//!
//! A run moves through `Initializing`, `BackingUp`, `WritingTable`,
//! `FlashingFirmware` and `Verifying` to `Completed`, then returns to `Idle`.
//! Any fatal error moves it to `Error`, where it stays until `reset`. Only one
//! run can be in flight; the state, result and statistics live behind a
//! single lock that readers hold just long enough to copy out.

pub mod chunk;
pub mod events;
pub mod flash_sm;
pub mod stats;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{info, warn};
use ota_config::FlasherConfig;
use partition_table::PartitionLayout;

pub use chunk::{calculate_chunk_size, patch_truncated_header};
pub use events::{
    ChannelObserver, FlashEvent, FlashObserver, LogObserver, ProgressEvent, StatusEvent,
};
pub use flash_sm::FlashOperationState;
pub use stats::FlashStatistics;

use crate::catalog::FirmwareCatalog;
use crate::error::{FlashResult, FlasherError};
use crate::flash::FlashStorage;
use crate::kv::KvStore;
use crate::metadata::MetadataStore;
use worker::Worker;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the engine handle and its worker.
pub(crate) struct Shared {
    pub sm: flash_sm::StateMachine<flash_sm::Context>,
    pub result: FlashResult,
    pub stats: FlashStatistics,
    pub layout: Option<PartitionLayout>,
    pub backup: Option<Vec<u8>>,
}

impl Shared {
    fn state(&self) -> FlashOperationState {
        self.sm.state().into()
    }
}

/// Handle on one flashing run.
pub struct FlashSession {
    id: u64,
    handle: Option<JoinHandle<FlashResult>>,
    abort: Arc<AtomicBool>,
}

impl FlashSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cancellation. The worker notices at its next chunk boundary.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Blocks until the worker exits and returns the run's result.
    pub fn wait(mut self) -> Result<FlashResult, FlasherError> {
        let Some(handle) = self.handle.take() else {
            return Err(FlasherError::InvalidState(
                "session was already joined".to_string(),
            ));
        };
        handle.join().map_err(|_| {
            FlasherError::InvalidState(format!("flash worker of run {} panicked", self.id))
        })
    }
}

pub struct FlashEngine<F, K>
where
    F: FlashStorage + Send + Sync + 'static,
    K: KvStore + Send + 'static,
{
    config: Arc<FlasherConfig>,
    flash: Arc<F>,
    metadata: Arc<Mutex<MetadataStore<K>>>,
    observer: Arc<dyn FlashObserver>,
    shared: Arc<Mutex<Shared>>,
    abort: Arc<AtomicBool>,
    /// Set while `restore_backup` rewrites the table outside the lock.
    restoring: AtomicBool,
}

impl<F, K> FlashEngine<F, K>
where
    F: FlashStorage + Send + Sync + 'static,
    K: KvStore + Send + 'static,
{
    pub fn new(
        config: FlasherConfig,
        flash: Arc<F>,
        metadata: MetadataStore<K>,
    ) -> Result<Self, FlasherError> {
        config
            .platform
            .validate()
            .and_then(|_| config.options.validate())
            .map_err(|e| FlasherError::InvalidArgument(format!("invalid configuration: {e:#}")))?;
        if flash.capacity() < config.platform.flash_size as usize {
            return Err(FlasherError::InvalidArgument(format!(
                "flash device holds {:#x} bytes, platform expects {:#x}",
                flash.capacity(),
                config.platform.flash_size
            )));
        }
        if flash.sector_size() == 0 || config.platform.sector_size as usize % flash.sector_size() != 0
        {
            return Err(FlasherError::InvalidArgument(format!(
                "platform sector size {:#x} is not a multiple of the device's {:#x}",
                config.platform.sector_size,
                flash.sector_size()
            )));
        }

        Ok(Self {
            config: Arc::new(config),
            flash,
            metadata: Arc::new(Mutex::new(metadata)),
            observer: Arc::new(LogObserver),
            shared: Arc::new(Mutex::new(Shared {
                sm: flash_sm::StateMachine::new(flash_sm::Context::default()),
                result: FlashResult::Success,
                stats: FlashStatistics::default(),
                layout: None,
                backup: None,
            })),
            abort: Arc::new(AtomicBool::new(false)),
            restoring: AtomicBool::new(false),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlashObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    pub fn flash(&self) -> &Arc<F> {
        &self.flash
    }

    pub fn metadata(&self) -> Arc<Mutex<MetadataStore<K>>> {
        self.metadata.clone()
    }

    /// Starts flashing the catalog's current selection on a background thread.
    ///
    /// Fails with `InvalidState` without any side effect unless the engine is idle.
    pub fn start(&self, catalog: &FirmwareCatalog) -> Result<FlashSession, FlasherError> {
        let selected = catalog.selected();
        if selected.is_empty() {
            return Err(FlasherError::InvalidArgument(
                "no firmware selected".to_string(),
            ));
        }

        let id = {
            let mut shared = lock(&self.shared);
            let state = shared.state();
            if state != FlashOperationState::Idle {
                return Err(FlasherError::InvalidState(format!(
                    "flashing already in progress ({state:?})"
                )));
            }
            if self.restoring.load(Ordering::Acquire) {
                return Err(FlasherError::InvalidState(
                    "partition table restore in progress".to_string(),
                ));
            }
            self.abort.store(false, Ordering::Relaxed);
            shared
                .sm
                .process_event(flash_sm::Events::Start)
                .map_err(|e| FlasherError::InvalidState(format!("cannot start: {e:?}")))?;
            shared.result = FlashResult::Success;
            shared.layout = None;
            shared.sm.context().runs
        };

        let worker = Worker {
            config: self.config.clone(),
            flash: self.flash.clone(),
            metadata: self.metadata.clone(),
            observer: self.observer.clone(),
            shared: self.shared.clone(),
            abort: self.abort.clone(),
            candidates: catalog.candidates().to_vec(),
            selected,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("flash-run-{id}"))
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let mut shared = lock(&self.shared);
                shared.result = FlashResult::WriteFailed;
                let _ = shared.sm.process_event(flash_sm::Events::Fail);
                return Err(FlasherError::Io(e));
            }
        };

        info!("Started flash run {}", id);
        Ok(FlashSession {
            id,
            handle: Some(handle),
            abort: self.abort.clone(),
        })
    }

    /// Requests cancellation of the running flash operation, if any.
    pub fn abort(&self) {
        if self.get_state() != FlashOperationState::Idle {
            warn!("Abort requested");
        }
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn get_state(&self) -> FlashOperationState {
        lock(&self.shared).state()
    }

    pub fn get_result(&self) -> FlashResult {
        lock(&self.shared).result
    }

    pub fn get_statistics(&self) -> FlashStatistics {
        lock(&self.shared).stats.clone()
    }

    /// Layout written by the current or last run.
    pub fn get_layout(&self) -> Option<PartitionLayout> {
        lock(&self.shared).layout.clone()
    }

    /// Table region as read before the last table write.
    pub fn backup(&self) -> Option<Vec<u8>> {
        lock(&self.shared).backup.clone()
    }

    /// Brings a failed engine back to `Idle`. A no-op when already idle.
    pub fn reset(&self) -> Result<(), FlasherError> {
        let mut shared = lock(&self.shared);
        match shared.state() {
            FlashOperationState::Idle => Ok(()),
            FlashOperationState::Error => {
                shared
                    .sm
                    .process_event(flash_sm::Events::Reset)
                    .map_err(|e| FlasherError::InvalidState(format!("cannot reset: {e:?}")))?;
                Ok(())
            }
            state => Err(FlasherError::InvalidState(format!(
                "cannot reset while {state:?}"
            ))),
        }
    }

    /// Writes the backed-up table back to flash. Runs cannot start until it
    /// returns; state queries are not blocked by the flash I/O.
    pub fn restore_backup(&self) -> Result<(), FlasherError> {
        let backup = {
            let shared = lock(&self.shared);
            let state = shared.state();
            if !matches!(
                state,
                FlashOperationState::Idle | FlashOperationState::Error
            ) {
                return Err(FlasherError::InvalidState(format!(
                    "cannot restore the partition table while {state:?}"
                )));
            }
            let backup = shared
                .backup
                .clone()
                .ok_or_else(|| FlasherError::NotFound("partition table backup".to_string()))?;
            if self.restoring.swap(true, Ordering::AcqRel) {
                return Err(FlasherError::InvalidState(
                    "partition table restore already in progress".to_string(),
                ));
            }
            backup
        };
        let _guard = RestoreGuard(&self.restoring);

        worker::write_table_region(
            &*self.flash,
            &self.config.platform,
            &backup,
            backup.len(),
        )?;
        info!("Restored partition table backup ({} bytes)", backup.len());
        Ok(())
    }
}

struct RestoreGuard<'a>(&'a AtomicBool);

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use crate::kv::MemoryKvStore;
    use ota_config::MIB;

    fn engine(capacity: usize) -> Result<FlashEngine<MemFlash, MemoryKvStore>, FlasherError> {
        FlashEngine::new(
            FlasherConfig::default(),
            Arc::new(MemFlash::new(capacity, 0x1000).unwrap()),
            MetadataStore::new(MemoryKvStore::new("fw_meta")),
        )
    }

    #[test]
    fn test_new_checks_device() {
        assert!(matches!(
            engine(MIB as usize),
            Err(FlasherError::InvalidArgument(_))
        ));
        let engine = engine(16 * MIB as usize).unwrap();
        assert_eq!(engine.get_state(), FlashOperationState::Idle);
        assert_eq!(engine.get_result(), FlashResult::Success);
        assert_eq!(engine.get_statistics(), FlashStatistics::default());
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = FlasherConfig::default();
        config.platform.app_alignment = 0;
        let result = FlashEngine::new(
            config,
            Arc::new(MemFlash::new(16 * MIB as usize, 0x1000).unwrap()),
            MetadataStore::new(MemoryKvStore::new("fw_meta")),
        );
        assert!(matches!(result, Err(FlasherError::InvalidArgument(_))));

        let mut config = FlasherConfig::default();
        config.options.progress_granularity = 0;
        let result = FlashEngine::new(
            config,
            Arc::new(MemFlash::new(16 * MIB as usize, 0x1000).unwrap()),
            MetadataStore::new(MemoryKvStore::new("fw_meta")),
        );
        assert!(matches!(result, Err(FlasherError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_requires_selection() {
        let engine = engine(16 * MIB as usize).unwrap();
        let catalog = FirmwareCatalog::new(&engine.config().options);
        assert!(matches!(
            engine.start(&catalog),
            Err(FlasherError::InvalidArgument(_))
        ));
        assert_eq!(engine.get_state(), FlashOperationState::Idle);
    }

    #[test]
    fn test_restore_without_backup() {
        let engine = engine(16 * MIB as usize).unwrap();
        assert!(matches!(
            engine.restore_backup(),
            Err(FlasherError::NotFound(_))
        ));
        engine.reset().unwrap();
    }
}
