// Licensed under the Apache-2.0 license

//! Records of what was flashed where, kept for the boot menu.
//!
//! Each record field lives under its own key (`fw_<i>_filename`,
//! `fw_<i>_partition`, ...) next to a `fw_count` key. A record missing any
//! field is treated as absent.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{KvError, KvStore, KvValue};

const COUNT_KEY: &str = "fw_count";
const FIELDS: [&str; 7] = [
    "filename",
    "partition",
    "offset",
    "size",
    "crc",
    "valid",
    "ts",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareMetadataRecord {
    pub filename: String,
    pub partition_name: String,
    pub offset: u32,
    pub size: u32,
    pub checksum: u32,
    pub is_valid: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("record index {index} is beyond the record count {count}")]
    IndexOutOfRange { index: usize, count: usize },
    #[error(transparent)]
    Kv(#[from] KvError),
}

fn key(index: usize, field: &str) -> String {
    format!("fw_{index}_{field}")
}

pub struct MetadataStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> MetadataStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn into_inner(self) -> K {
        self.kv
    }

    pub fn get_count(&self) -> Result<usize, MetadataError> {
        Ok(self.kv.get_u32(COUNT_KEY)?.unwrap_or(0) as usize)
    }

    pub fn set_count(&mut self, count: usize) -> Result<(), MetadataError> {
        self.kv.set(COUNT_KEY, KvValue::U32(count as u32))?;
        self.kv.commit()?;
        Ok(())
    }

    /// Returns `None` for an index past the count or a record with a missing field.
    pub fn get(&self, index: usize) -> Result<Option<FirmwareMetadataRecord>, MetadataError> {
        if index >= self.get_count()? {
            return Ok(None);
        }
        match self.read_record(index) {
            Ok(record) => Ok(record),
            // A field holding the wrong type is as good as missing
            Err(KvError::TypeMismatch { key, .. }) => {
                warn!("Ignoring metadata record {index}: bad field {key}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_record(&self, index: usize) -> Result<Option<FirmwareMetadataRecord>, KvError> {
        let Some(filename) = self.kv.get_str(&key(index, "filename"))? else {
            return Ok(None);
        };
        let Some(partition_name) = self.kv.get_str(&key(index, "partition"))? else {
            return Ok(None);
        };
        let Some(offset) = self.kv.get_u32(&key(index, "offset"))? else {
            return Ok(None);
        };
        let Some(size) = self.kv.get_u32(&key(index, "size"))? else {
            return Ok(None);
        };
        let Some(checksum) = self.kv.get_u32(&key(index, "crc"))? else {
            return Ok(None);
        };
        let Some(valid) = self.kv.get_u32(&key(index, "valid"))? else {
            return Ok(None);
        };
        let Some(timestamp) = self.kv.get_u64(&key(index, "ts"))? else {
            return Ok(None);
        };
        Ok(Some(FirmwareMetadataRecord {
            filename,
            partition_name,
            offset,
            size,
            checksum,
            is_valid: valid != 0,
            timestamp: timestamp as i64,
        }))
    }

    /// Writes every field of the record and commits once. `index` may be at
    /// most the current count, in which case the record is appended.
    pub fn set(
        &mut self,
        index: usize,
        record: &FirmwareMetadataRecord,
    ) -> Result<(), MetadataError> {
        let count = self.get_count()?;
        if index > count {
            return Err(MetadataError::IndexOutOfRange { index, count });
        }
        self.kv
            .set(&key(index, "filename"), KvValue::Str(record.filename.clone()))?;
        self.kv.set(
            &key(index, "partition"),
            KvValue::Str(record.partition_name.clone()),
        )?;
        self.kv
            .set(&key(index, "offset"), KvValue::U32(record.offset))?;
        self.kv.set(&key(index, "size"), KvValue::U32(record.size))?;
        self.kv
            .set(&key(index, "crc"), KvValue::U32(record.checksum))?;
        self.kv
            .set(&key(index, "valid"), KvValue::U32(record.is_valid as u32))?;
        self.kv
            .set(&key(index, "ts"), KvValue::U64(record.timestamp as u64))?;
        if index == count {
            self.kv.set(COUNT_KEY, KvValue::U32(count as u32 + 1))?;
        }
        self.kv.commit()?;
        Ok(())
    }

    /// Erases one record. Deleting the last record also shrinks the count;
    /// any other index leaves a hole that `get` and `list` skip.
    pub fn delete(&mut self, index: usize) -> Result<(), MetadataError> {
        let count = self.get_count()?;
        if index >= count {
            return Err(MetadataError::IndexOutOfRange { index, count });
        }
        for field in FIELDS {
            self.kv.erase(&key(index, field))?;
        }
        if index + 1 == count {
            self.kv.set(COUNT_KEY, KvValue::U32(index as u32))?;
        }
        self.kv.commit()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<(), MetadataError> {
        let count = self.get_count()?;
        for index in 0..count {
            for field in FIELDS {
                self.kv.erase(&key(index, field))?;
            }
        }
        self.kv.set(COUNT_KEY, KvValue::U32(0))?;
        self.kv.commit()?;
        Ok(())
    }

    pub fn find_by_partition(&self, partition_name: &str) -> Result<Option<usize>, MetadataError> {
        for index in 0..self.get_count()? {
            if let Some(record) = self.get(index)? {
                if record.partition_name == partition_name {
                    return Ok(Some(index));
                }
            }
        }
        Ok(None)
    }

    /// Overwrites the record for the same partition, or appends a new one.
    pub fn upsert(&mut self, record: &FirmwareMetadataRecord) -> Result<usize, MetadataError> {
        let index = match self.find_by_partition(&record.partition_name)? {
            Some(index) => index,
            None => self.get_count()?,
        };
        self.set(index, record)?;
        Ok(index)
    }

    /// Every complete record, with its index.
    pub fn list(&self) -> Result<Vec<(usize, FirmwareMetadataRecord)>, MetadataError> {
        let mut records = vec![];
        for index in 0..self.get_count()? {
            if let Some(record) = self.get(index)? {
                records.push((index, record));
            }
        }
        Ok(records)
    }
}
