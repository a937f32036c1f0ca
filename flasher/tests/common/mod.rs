// Licensed under the Apache-2.0 license

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::LevelFilter;
use ota_flasher::{
    ChannelObserver, FirmwareCatalog, FlashDrvError, FlashEngine, FlashEvent, FlashOperationState,
    FlashStorage, FlasherConfig, KvError, KvStore, KvValue, MemFlash, MemoryKvStore,
    MetadataStore, StatusEvent,
};
use simple_logger::SimpleLogger;
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// Image content: a valid header followed by a byte pattern derived from `seed`.
pub fn firmware_image(size: usize, seed: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    data[0] = 0xE9;
    data[1] = 3;
    data[23] = 1;
    data
}

pub fn write_firmware(dir: &Path, name: &str, size: usize, seed: u8) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, firmware_image(size, seed)).unwrap();
    path
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// The read returns an error.
    Fail,
    /// The read succeeds but the first byte comes back flipped.
    Corrupt,
}

/// One-shot fault on a read at `address`, after `skip` matching reads went through.
struct PendingRead {
    address: usize,
    skip: usize,
    fault: ReadFault,
}

#[derive(Default)]
struct Gate {
    paused: bool,
    /// Writes currently held by the pause.
    waiting: usize,
}

/// In-memory flash that sleeps on every write, can be paused and can inject faults.
pub struct SlowFlash {
    inner: MemFlash,
    delay: Duration,
    gate: Mutex<Gate>,
    resumed: Condvar,
    read_fault: Mutex<Option<PendingRead>>,
    /// Writes left before the next one fails.
    fail_write_in: Mutex<Option<usize>>,
    panic_on_write: Mutex<bool>,
}

impl SlowFlash {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            inner: MemFlash::new(capacity, 0x1000).unwrap(),
            delay,
            gate: Mutex::new(Gate::default()),
            resumed: Condvar::new(),
            read_fault: Mutex::new(None),
            fail_write_in: Mutex::new(None),
            panic_on_write: Mutex::new(false),
        }
    }

    /// Blocks every following write until `resume`.
    pub fn pause(&self) {
        self.gate.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.gate.lock().unwrap().paused = false;
        self.resumed.notify_all();
    }

    /// Waits until a write is held by `pause`.
    pub fn wait_for_blocked_write(&self) {
        let start = Instant::now();
        while self.gate.lock().unwrap().waiting == 0 {
            assert!(start.elapsed() < TIMEOUT, "No write reached the paused flash");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn fault_read(&self, address: usize, skip: usize, fault: ReadFault) {
        *self.read_fault.lock().unwrap() = Some(PendingRead {
            address,
            skip,
            fault,
        });
    }

    /// The write after the next `writes` succeeds fails.
    pub fn fail_write_after(&self, writes: usize) {
        *self.fail_write_in.lock().unwrap() = Some(writes);
    }

    pub fn panic_on_next_write(&self) {
        *self.panic_on_write.lock().unwrap() = true;
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot()
    }

    fn take_read_fault(&self, address: usize) -> Option<ReadFault> {
        let mut pending = self.read_fault.lock().unwrap();
        let hit = match pending.as_mut() {
            Some(p) if p.address == address => {
                if p.skip == 0 {
                    true
                } else {
                    p.skip -= 1;
                    false
                }
            }
            _ => false,
        };
        if hit {
            pending.take().map(|p| p.fault)
        } else {
            None
        }
    }

    fn write_should_fail(&self) -> bool {
        let mut remaining = self.fail_write_in.lock().unwrap();
        let current = *remaining;
        match current {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

impl FlashStorage for SlowFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        match self.take_read_fault(address) {
            Some(ReadFault::Fail) => Err(FlashDrvError::Fail),
            Some(ReadFault::Corrupt) => {
                self.inner.read(buffer, address)?;
                if let Some(first) = buffer.first_mut() {
                    *first ^= 0xFF;
                }
                Ok(())
            }
            None => self.inner.read(buffer, address),
        }
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        let panic_now = std::mem::take(&mut *self.panic_on_write.lock().unwrap());
        if panic_now {
            panic!("flash controller wedged at {address:#x}");
        }
        {
            let mut gate = self.gate.lock().unwrap();
            gate.waiting += 1;
            while gate.paused {
                gate = self.resumed.wait(gate).unwrap();
            }
            gate.waiting -= 1;
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.write_should_fail() {
            return Err(FlashDrvError::Fail);
        }
        self.inner.write(buffer, address)
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        self.inner.erase(address, length)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }
}

/// Key/value store whose commits always fail.
pub struct FailingKvStore {
    inner: MemoryKvStore,
}

impl FailingKvStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            inner: MemoryKvStore::new(namespace),
        }
    }
}

impl KvStore for FailingKvStore {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    fn get(&self, key: &str) -> Result<Option<KvValue>, KvError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: KvValue) -> Result<(), KvError> {
        self.inner.set(key, value)
    }

    fn erase(&mut self, key: &str) -> Result<(), KvError> {
        self.inner.erase(key)
    }

    fn commit(&mut self) -> Result<(), KvError> {
        Err(KvError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "storage is read-only",
        )))
    }
}

pub type TestEngine<K = MemoryKvStore> = FlashEngine<SlowFlash, K>;

pub struct TestSetup<K: KvStore + Send + 'static = MemoryKvStore> {
    pub dir: TempDir,
    pub flash: Arc<SlowFlash>,
    pub engine: TestEngine<K>,
    pub catalog: FirmwareCatalog,
    pub events: Receiver<FlashEvent>,
}

impl TestSetup {
    /// Writes one image per `(name, size)` into a fresh directory, scans it and
    /// selects every image in the given order.
    pub fn new(config: FlasherConfig, images: &[(&str, usize)], write_delay: Duration) -> Self {
        let kv = MemoryKvStore::new(&config.options.metadata_namespace);
        TestSetup::with_store(config, images, write_delay, kv)
    }
}

impl<K: KvStore + Send + 'static> TestSetup<K> {
    pub fn with_store(
        config: FlasherConfig,
        images: &[(&str, usize)],
        write_delay: Duration,
        kv: K,
    ) -> Self {
        setup_logger();
        let dir = tempfile::tempdir().unwrap();
        for (seed, (name, size)) in images.iter().enumerate() {
            write_firmware(dir.path(), name, *size, seed as u8);
        }

        let flash = Arc::new(SlowFlash::new(
            config.platform.flash_size as usize,
            write_delay,
        ));
        let mut catalog = FirmwareCatalog::new(&config.options);
        catalog.scan(dir.path()).unwrap();
        for (name, _) in images {
            let index = catalog
                .candidates()
                .iter()
                .position(|c| c.file_path.file_name().unwrap() == *name)
                .unwrap();
            catalog.select(index, true).unwrap();
        }

        let (observer, events) = ChannelObserver::new();
        let engine = FlashEngine::new(config, flash.clone(), MetadataStore::new(kv))
            .unwrap()
            .with_observer(Arc::new(observer));

        Self {
            dir,
            flash,
            engine,
            catalog,
            events,
        }
    }

    pub fn wait_for_state(&self, expected: FlashOperationState) {
        wait_for_state(&self.engine, expected);
    }

    /// Status notifications received so far.
    pub fn drain_status(&self) -> Vec<StatusEvent> {
        self.events
            .try_iter()
            .filter_map(|event| match event {
                FlashEvent::Status(status) => Some(status),
                FlashEvent::Progress(_) => None,
            })
            .collect()
    }
}

pub fn wait_for_state<K: KvStore + Send + 'static>(
    engine: &TestEngine<K>,
    expected: FlashOperationState,
) {
    let start = Instant::now();
    while engine.get_state() != expected {
        if start.elapsed() > TIMEOUT {
            panic!(
                "Timed out waiting for {:?}, engine is {:?}",
                expected,
                engine.get_state()
            );
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
