//! Photo service - the boundary operations callers use
//!
//! Every operation runs on a detached task: once a chain has started, its
//! result is persisted even if the caller stops waiting. With
//! `serialize_per_record` set, runs for the same identity queue behind a
//! per-identity lock; different identities never wait on each other.

use crate::chain::{AttemptReport, ChainInput, ChainStats, FallbackChain};
use crate::config::{Config, PipelineConfig, StorageConfig};
use crate::error::{PhotoError, Stage};
use crate::processor::{self, ImageProcessor};
use crate::record::{PhotoFields, PhotoRecord, ProducedBy};
use crate::record_store::{RecordStore, SledRecordStore};
use crate::resolver::{ByteResolver, RawPhoto};
use crate::storage::{HttpObjectStore, LocalObjectStore, ObjectKey, ObjectStorage};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Record after a chain run, with what each strategy did
#[derive(Debug, Clone, Serialize)]
pub struct CleanedPhoto {
    pub record: PhotoRecord,
    pub attempts: Vec<AttemptReport>,
}

/// Outcome of one record in a bulk re-clean
#[derive(Debug, Clone, Serialize)]
pub struct RecleanResult {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<ProducedBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ServiceInner {
    records: Arc<dyn RecordStore>,
    storage: Arc<dyn ObjectStorage>,
    chain: FallbackChain,
    locks: DashMap<String, Arc<Mutex<()>>>,
    serialize_per_record: bool,
    staging_timeout: Duration,
    files: Option<Arc<LocalObjectStore>>,
}

#[derive(Clone)]
pub struct PhotoService {
    inner: Arc<ServiceInner>,
}

impl PhotoService {
    /// Wire a service from explicit collaborators
    pub fn new(
        pipeline: &PipelineConfig,
        records: Arc<dyn RecordStore>,
        storage: Arc<dyn ObjectStorage>,
        processor: Option<Arc<dyn ImageProcessor>>,
    ) -> Result<Self, PhotoError> {
        Self::build(pipeline, records, storage, processor, None)
    }

    fn build(
        pipeline: &PipelineConfig,
        records: Arc<dyn RecordStore>,
        storage: Arc<dyn ObjectStorage>,
        processor: Option<Arc<dyn ImageProcessor>>,
        files: Option<Arc<LocalObjectStore>>,
    ) -> Result<Self, PhotoError> {
        let resolver = ByteResolver::new(pipeline.timeout(), pipeline.max_download_bytes)?
            .with_local_store(storage.clone());
        let chain = FallbackChain::new(pipeline, resolver, processor, storage.clone())?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                records,
                storage,
                chain,
                locks: DashMap::new(),
                serialize_per_record: pipeline.serialize_per_record,
                staging_timeout: pipeline.timeout(),
                files,
            }),
        })
    }

    /// Open the durable record store and the configured object store
    pub async fn open(config: &Config) -> Result<Self, PhotoError> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
        let records: Arc<dyn RecordStore> =
            Arc::new(SledRecordStore::open(config.records_db_path())?);

        let (storage, files): (Arc<dyn ObjectStorage>, Option<Arc<LocalObjectStore>>) =
            match &config.storage {
                StorageConfig::Local { public_base_url } => {
                    let local =
                        Arc::new(LocalObjectStore::new(config.objects_dir(), public_base_url.clone()).await?);
                    (local.clone(), Some(local))
                }
                StorageConfig::Remote {
                    upload_url,
                    public_base_url,
                    bearer_token,
                } => {
                    let remote = HttpObjectStore::new(
                        upload_url.clone(),
                        public_base_url.clone(),
                        bearer_token.clone(),
                        config.pipeline.timeout(),
                    )?;
                    (Arc::new(remote), None)
                }
            };

        let processor = processor::from_config(&config.processor);
        Self::build(&config.pipeline, records, storage, processor, files)
    }

    /// Local object store whose objects this service should serve, if any
    pub fn local_files(&self) -> Option<Arc<LocalObjectStore>> {
        self.inner.files.clone()
    }

    /// Set the raw photo for an identity and run the fallback chain
    pub async fn submit_raw_photo(
        &self,
        identity: &str,
        raw_reference: &str,
    ) -> Result<CleanedPhoto, PhotoError> {
        let identity = validate_identity(identity)?;
        let raw_reference = raw_reference.trim().to_string();
        if raw_reference.is_empty() {
            return Err(PhotoError::InvalidInput("raw reference is empty".into()));
        }

        self.detached(move |inner| async move {
            let _guard = inner.lock(&identity).await;
            let input = ChainInput::reference(identity.clone(), raw_reference.clone());
            let outcome = inner.chain.run(input).await?;

            let record = inner
                .records
                .update(
                    &identity,
                    PhotoFields::submitted(raw_reference, outcome.clean_reference, outcome.produced_by),
                )
                .await?;
            Ok(CleanedPhoto {
                record,
                attempts: outcome.attempts,
            })
        })
        .await
    }

    /// Stage caller-supplied bytes as the raw photo, then run the chain on them
    pub async fn submit_uploaded_photo(
        &self,
        identity: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> Result<CleanedPhoto, PhotoError> {
        let identity = validate_identity(identity)?;
        if data.is_empty() {
            return Err(PhotoError::InvalidInput("uploaded photo is empty".into()));
        }
        let photo = RawPhoto::new(data, content_type);

        self.detached(move |inner| async move {
            let _guard = inner.lock(&identity).await;

            let key = ObjectKey::raw(&identity, &photo.bytes, photo.extension());
            let raw_reference = match tokio::time::timeout(
                inner.staging_timeout,
                inner.storage.upload(&key, photo.bytes.clone()),
            )
            .await
            {
                Ok(Ok(uri)) => uri,
                Ok(Err(e)) => return Err(PhotoError::StorageFailed(format!("staging raw photo: {}", e))),
                Err(_) => {
                    return Err(PhotoError::Timeout {
                        stage: Stage::Uploading,
                        after_ms: inner.staging_timeout.as_millis() as u64,
                    })
                }
            };
            info!(identity = %identity, raw = %raw_reference, size = photo.len(), "Staged uploaded photo");

            let input = ChainInput::uploaded(identity.clone(), raw_reference.clone(), photo);
            let outcome = inner.chain.run(input).await?;

            let record = inner
                .records
                .update(
                    &identity,
                    PhotoFields::submitted(raw_reference, outcome.clean_reference, outcome.produced_by),
                )
                .await?;
            Ok(CleanedPhoto {
                record,
                attempts: outcome.attempts,
            })
        })
        .await
    }

    /// Re-run the chain against the raw photo on file
    pub async fn reclean_photo(&self, identity: &str) -> Result<CleanedPhoto, PhotoError> {
        let identity = validate_identity(identity)?;
        self.detached(move |inner| async move { inner.reclean(&identity).await })
            .await
    }

    /// Re-run the chain for every record not produced by the local pipeline
    pub async fn reclean_degraded(&self) -> Result<Vec<RecleanResult>, PhotoError> {
        self.detached(|inner| async move {
            let candidates: Vec<String> = inner
                .records
                .list()
                .await?
                .into_iter()
                .filter(|r| r.raw_reference.is_some() && !r.is_fully_cleaned())
                .map(|r| r.identity)
                .collect();

            info!(count = candidates.len(), "Re-cleaning degraded photos");

            let mut results = Vec::with_capacity(candidates.len());
            for identity in candidates {
                match inner.reclean(&identity).await {
                    Ok(cleaned) => results.push(RecleanResult {
                        identity,
                        produced_by: cleaned.record.produced_by,
                        error: None,
                    }),
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Re-clean failed");
                        results.push(RecleanResult {
                            identity,
                            produced_by: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
            Ok(results)
        })
        .await
    }

    pub async fn get_photo(&self, identity: &str) -> Result<PhotoRecord, PhotoError> {
        let identity = validate_identity(identity)?;
        self.inner
            .records
            .get(&identity)
            .await?
            .ok_or_else(|| PhotoError::NotFound(identity.clone()))
    }

    /// Clear the photo fields when the owning entity is deleted
    pub async fn forget_photo(&self, identity: &str) -> Result<(), PhotoError> {
        let identity = validate_identity(identity)?;
        self.detached(move |inner| async move {
            let _guard = inner.lock(&identity).await;
            inner.records.delete(&identity).await?;
            info!(identity = %identity, "Forgot photo record");
            Ok(())
        })
        .await
    }

    /// Persist buffered record writes
    pub async fn flush(&self) -> Result<(), PhotoError> {
        self.inner.records.flush().await
    }

    pub fn stats(&self) -> ChainStats {
        self.inner.chain.stats()
    }

    /// Run `work` on its own task so dropping the caller does not cancel it
    async fn detached<T, F, Fut>(&self, work: F) -> Result<T, PhotoError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<ServiceInner>) -> Fut,
        Fut: Future<Output = Result<T, PhotoError>> + Send + 'static,
    {
        let handle = tokio::spawn(work(self.inner.clone()));
        handle
            .await
            .map_err(|e| PhotoError::Internal(format!("pipeline task failed: {}", e)))?
    }
}

impl ServiceInner {
    async fn reclean(&self, identity: &str) -> Result<CleanedPhoto, PhotoError> {
        let _guard = self.lock(identity).await;

        let record = self
            .records
            .get(identity)
            .await?
            .ok_or_else(|| PhotoError::NotFound(identity.to_string()))?;
        let raw_reference = record
            .raw_reference
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| PhotoError::InvalidInput(format!("no raw photo on file for {}", identity)))?;

        let outcome = self
            .chain
            .run(ChainInput::reference(identity, raw_reference.clone()))
            .await?;

        // Raw and clean are written as one unit
        let record = self
            .records
            .update(
                identity,
                PhotoFields::submitted(raw_reference, outcome.clean_reference, outcome.produced_by),
            )
            .await?;
        Ok(CleanedPhoto {
            record,
            attempts: outcome.attempts,
        })
    }

    async fn lock(&self, identity: &str) -> Option<RecordGuard<'_>> {
        if !self.serialize_per_record {
            return None;
        }
        let mutex = self
            .locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        Some(RecordGuard {
            locks: &self.locks,
            identity: identity.to_string(),
            guard: Some(guard),
        })
    }
}

/// Holds the per-identity lock; drops the map entry when nobody else waits
struct RecordGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    identity: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.identity, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

fn validate_identity(identity: &str) -> Result<String, PhotoError> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(PhotoError::InvalidInput("identity is empty".into()));
    }
    Ok(identity.to_string())
}
