//! Durable store for photo records
//!
//! Records are keyed by member identity. Every update is a whole-field write
//! (raw, clean, produced-by), so concurrent writers resolve last-write-wins
//! without transactions.

use crate::error::PhotoError;
use crate::record::{PhotoFields, PhotoRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use sled::Db;
use std::path::Path;
use tracing::{debug, info};

/// Record store collaborator used by the photo service
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up the record for an identity
    async fn get(&self, identity: &str) -> Result<Option<PhotoRecord>, PhotoError>;

    /// Create an empty record; returns the existing one if already present
    async fn create(&self, identity: &str) -> Result<PhotoRecord, PhotoError>;

    /// Write fields, creating the record if it does not exist yet
    async fn update(&self, identity: &str, fields: PhotoFields) -> Result<PhotoRecord, PhotoError>;

    /// Remove the record (owning entity deleted)
    async fn delete(&self, identity: &str) -> Result<(), PhotoError>;

    /// All records, in key order
    async fn list(&self) -> Result<Vec<PhotoRecord>, PhotoError>;

    /// Persist buffered writes
    async fn flush(&self) -> Result<(), PhotoError> {
        Ok(())
    }
}

/// sled-backed record store
pub struct SledRecordStore {
    db: Db,
}

impl SledRecordStore {
    /// Open or create the record database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PhotoError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened record database");
        Ok(Self { db })
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self, PhotoError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn put(&self, record: &PhotoRecord) -> Result<(), PhotoError> {
        let value = rmp_serde::to_vec_named(record)?;
        self.db.insert(record.identity.as_bytes(), value)?;
        Ok(())
    }

    fn read(&self, identity: &str) -> Result<Option<PhotoRecord>, PhotoError> {
        match self.db.get(identity.as_bytes())? {
            Some(value) => Ok(Some(rmp_serde::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordStore for SledRecordStore {
    async fn get(&self, identity: &str) -> Result<Option<PhotoRecord>, PhotoError> {
        self.read(identity)
    }

    async fn create(&self, identity: &str) -> Result<PhotoRecord, PhotoError> {
        if let Some(existing) = self.read(identity)? {
            return Ok(existing);
        }
        let record = PhotoRecord::empty(identity);
        self.put(&record)?;
        debug!(identity = %identity, "Created photo record");
        Ok(record)
    }

    async fn update(&self, identity: &str, fields: PhotoFields) -> Result<PhotoRecord, PhotoError> {
        let mut record = self
            .read(identity)?
            .unwrap_or_else(|| PhotoRecord::empty(identity));
        record.apply(fields);
        self.put(&record)?;
        Ok(record)
    }

    async fn delete(&self, identity: &str) -> Result<(), PhotoError> {
        self.db.remove(identity.as_bytes())?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PhotoRecord>, PhotoError> {
        let mut records = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item?;
            records.push(rmp_serde::from_slice(&value)?);
        }
        Ok(records)
    }

    async fn flush(&self) -> Result<(), PhotoError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// In-memory record store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, PhotoRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, identity: &str) -> Result<Option<PhotoRecord>, PhotoError> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    async fn create(&self, identity: &str) -> Result<PhotoRecord, PhotoError> {
        let entry = self
            .records
            .entry(identity.to_string())
            .or_insert_with(|| PhotoRecord::empty(identity));
        Ok(entry.value().clone())
    }

    async fn update(&self, identity: &str, fields: PhotoFields) -> Result<PhotoRecord, PhotoError> {
        let mut entry = self
            .records
            .entry(identity.to_string())
            .or_insert_with(|| PhotoRecord::empty(identity));
        entry.apply(fields);
        Ok(entry.value().clone())
    }

    async fn delete(&self, identity: &str) -> Result<(), PhotoError> {
        self.records.remove(identity);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PhotoRecord>, PhotoError> {
        let mut records: Vec<PhotoRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }
}
