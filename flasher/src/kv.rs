// Licensed under the Apache-2.0 license

//! Namespace-scoped persistent key/value storage. Writes are staged and only
//! become durable on `commit`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KvValue {
    Str(String),
    U32(u32),
    U64(u64),
    Blob(Vec<u8>),
}

impl KvValue {
    fn type_name(&self) -> &'static str {
        match self {
            KvValue::Str(_) => "string",
            KvValue::U32(_) => "u32",
            KvValue::U64(_) => "u64",
            KvValue::Blob(_) => "blob",
        }
    }
}

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key '{key}' holds a {found} value, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("key/value store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key/value store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub trait KvStore {
    fn namespace(&self) -> &str;

    /// Reads a value, including writes that are staged but not yet committed.
    fn get(&self, key: &str) -> Result<Option<KvValue>, KvError>;

    fn set(&mut self, key: &str, value: KvValue) -> Result<(), KvError>;

    /// Removes a key. Removing a missing key is not an error.
    fn erase(&mut self, key: &str) -> Result<(), KvError>;

    fn commit(&mut self) -> Result<(), KvError>;

    fn get_str(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::Str(s)) => Ok(Some(s)),
            Some(other) => Err(mismatch(key, "string", &other)),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, KvError> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::U32(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, "u32", &other)),
        }
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>, KvError> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::U64(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, "u64", &other)),
        }
    }
}

fn mismatch(key: &str, expected: &'static str, found: &KvValue) -> KvError {
    KvError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

/// Committed entries plus the writes staged on top of them. `None` stages an erase.
#[derive(Debug, Default)]
struct Staged {
    committed: BTreeMap<String, KvValue>,
    pending: BTreeMap<String, Option<KvValue>>,
}

impl Staged {
    fn get(&self, key: &str) -> Option<KvValue> {
        match self.pending.get(key) {
            Some(staged) => staged.clone(),
            None => self.committed.get(key).cloned(),
        }
    }

    fn set(&mut self, key: &str, value: Option<KvValue>) {
        self.pending.insert(key.to_string(), value);
    }

    /// The committed map as it will be after the pending writes are applied.
    fn merged(&self) -> BTreeMap<String, KvValue> {
        let mut merged = self.committed.clone();
        for (key, value) in &self.pending {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        merged
    }
}

/// Volatile store, used by tests and hosts without persistent storage.
#[derive(Debug)]
pub struct MemoryKvStore {
    namespace: String,
    entries: Staged,
}

impl MemoryKvStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: Staged::default(),
        }
    }

    /// Drops staged writes, as a power loss before `commit` would.
    pub fn discard_uncommitted(&mut self) {
        self.entries.pending.clear();
    }
}

impl KvStore for MemoryKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get(&self, key: &str) -> Result<Option<KvValue>, KvError> {
        Ok(self.entries.get(key))
    }

    fn set(&mut self, key: &str, value: KvValue) -> Result<(), KvError> {
        self.entries.set(key, Some(value));
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), KvError> {
        self.entries.set(key, None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KvError> {
        self.entries.committed = self.entries.merged();
        self.entries.pending.clear();
        Ok(())
    }
}

type Namespaces = BTreeMap<String, BTreeMap<String, KvValue>>;

/// Store persisted as a JSON document holding every namespace. A commit
/// rewrites the document through a temporary file that is renamed over it.
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    namespace: String,
    entries: Staged,
}

impl JsonFileKvStore {
    pub fn open(path: &Path, namespace: &str) -> Result<Self, KvError> {
        let mut namespaces = Self::load(path)?;
        let committed = namespaces.remove(namespace).unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            namespace: namespace.to_string(),
            entries: Staged {
                committed,
                pending: BTreeMap::new(),
            },
        })
    }

    fn load(path: &Path) -> Result<Namespaces, KvError> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(Namespaces::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Namespaces::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn discard_uncommitted(&mut self) {
        self.entries.pending.clear();
    }
}

impl KvStore for JsonFileKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get(&self, key: &str) -> Result<Option<KvValue>, KvError> {
        Ok(self.entries.get(key))
    }

    fn set(&mut self, key: &str, value: KvValue) -> Result<(), KvError> {
        self.entries.set(key, Some(value));
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), KvError> {
        self.entries.set(key, None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KvError> {
        if self.entries.pending.is_empty() {
            return Ok(());
        }
        let merged = self.entries.merged();

        // Other namespaces may have been committed by another handle since open.
        let mut namespaces = Self::load(&self.path)?;
        namespaces.insert(self.namespace.clone(), merged.clone());

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &namespaces)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KvError::Io(e.error))?;

        self.entries.committed = merged;
        self.entries.pending.clear();
        debug!(
            "Committed namespace '{}' to {}",
            self.namespace,
            self.path.display()
        );
        Ok(())
    }
}
