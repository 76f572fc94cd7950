//! Fallback chain - ordered strategies that always yield a clean reference
//!
//! ```text
//! LocalPipeline        resolve -> process -> upload -> new object URI
//!       | any stage fails or times out
//!       v
//! TransformConvention  raw URL matches provider pattern -> raw + suffix
//!       | not configured / no match
//!       v
//! Passthrough          raw URL unchanged (always applies)
//! ```
//!
//! Each strategy is a guard (may it run for this input?) and an action. No
//! stage is retried; a failure moves strictly forward to the next strategy.
//! Stage failures are logged and counted, never returned to the caller.

use crate::config::PipelineConfig;
use crate::error::{PhotoError, Stage};
use crate::processor::{ImageProcessor, ProcessOptions};
use crate::record::ProducedBy;
use crate::resolver::{ByteResolver, PhotoSource, RawPhoto};
use crate::storage::{ObjectKey, ObjectStorage};
use crate::transform::TransformConvention;
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Strategies in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LocalPipeline,
    TransformConvention,
    Passthrough,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [
        Strategy::LocalPipeline,
        Strategy::TransformConvention,
        Strategy::Passthrough,
    ];

    pub fn produced_by(&self) -> ProducedBy {
        match self {
            Strategy::LocalPipeline => ProducedBy::LocalPipeline,
            Strategy::TransformConvention => ProducedBy::TransformConvention,
            Strategy::Passthrough => ProducedBy::Passthrough,
        }
    }
}

/// One chain invocation
#[derive(Debug, Clone)]
pub struct ChainInput {
    pub identity: String,
    pub raw_reference: String,
    /// Bytes already in memory (uploaded by the caller); skips the download
    pub upload: Option<RawPhoto>,
}

impl ChainInput {
    pub fn reference(identity: impl Into<String>, raw_reference: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            raw_reference: raw_reference.into(),
            upload: None,
        }
    }

    pub fn uploaded(
        identity: impl Into<String>,
        raw_reference: impl Into<String>,
        photo: RawPhoto,
    ) -> Self {
        Self {
            identity: identity.into(),
            raw_reference: raw_reference.into(),
            upload: Some(photo),
        }
    }
}

/// What happened to one strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Guard rejected the strategy
    Skipped { reason: String },
    /// Strategy ran and a stage failed
    Failed { stage: Stage, error: String },
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptReport {
    pub strategy: ProducedBy,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Result of a chain run
#[derive(Debug, Clone, Serialize)]
pub struct ChainOutcome {
    pub clean_reference: String,
    pub produced_by: ProducedBy,
    pub attempts: Vec<AttemptReport>,
}

#[derive(Default)]
struct ChainCounters {
    runs: AtomicU64,
    local_pipeline: AtomicU64,
    transform_convention: AtomicU64,
    passthrough: AtomicU64,
    resolution_failures: AtomicU64,
    processing_failures: AtomicU64,
    storage_failures: AtomicU64,
}

/// Public statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainStats {
    pub runs: u64,
    pub local_pipeline: u64,
    pub transform_convention: u64,
    pub passthrough: u64,
    pub resolution_failures: u64,
    pub processing_failures: u64,
    pub storage_failures: u64,
}

pub struct FallbackChain {
    resolver: ByteResolver,
    processor: Option<Arc<dyn ImageProcessor>>,
    storage: Arc<dyn ObjectStorage>,
    transform: Option<TransformConvention>,
    options: ProcessOptions,
    processing_timeout: Duration,
    upload_timeout: Duration,
    counters: ChainCounters,
}

impl FallbackChain {
    /// Build a chain from pipeline options and its collaborators.
    /// `processor: None` disables the local pipeline.
    pub fn new(
        config: &PipelineConfig,
        resolver: ByteResolver,
        processor: Option<Arc<dyn ImageProcessor>>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self, PhotoError> {
        config.validate()?;
        let transform = TransformConvention::from_config(config)?;

        if let Some(ref processor) = processor {
            info!(processor = processor.name(), "Local pipeline enabled");
        } else {
            info!("Local pipeline disabled");
        }

        Ok(Self {
            resolver,
            processor,
            storage,
            transform,
            options: ProcessOptions {
                max_dimension: config.max_dimension,
                canvas_color: config.canvas_color,
            },
            processing_timeout: config.processing_timeout(),
            upload_timeout: config.timeout(),
            counters: ChainCounters::default(),
        })
    }

    /// Run strategies in order until one succeeds
    pub async fn run(&self, input: ChainInput) -> Result<ChainOutcome, PhotoError> {
        if input.raw_reference.trim().is_empty() {
            return Err(PhotoError::InvalidInput("raw reference is empty".into()));
        }

        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(Strategy::ORDER.len());
        let mut input = input;

        for strategy in Strategy::ORDER {
            if let Err(reason) = self.guard(strategy, &input) {
                debug!(identity = %input.identity, strategy = %strategy.produced_by(), reason = %reason, "Strategy skipped");
                attempts.push(AttemptReport {
                    strategy: strategy.produced_by(),
                    outcome: AttemptOutcome::Skipped { reason },
                });
                continue;
            }

            match self.attempt(strategy, &mut input).await {
                Ok(clean_reference) => {
                    self.count_success(strategy);
                    info!(
                        identity = %input.identity,
                        strategy = %strategy.produced_by(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Photo cleaned"
                    );
                    attempts.push(AttemptReport {
                        strategy: strategy.produced_by(),
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return Ok(ChainOutcome {
                        clean_reference,
                        produced_by: strategy.produced_by(),
                        attempts,
                    });
                }
                Err((stage, error)) => {
                    self.count_failure(stage);
                    warn!(
                        identity = %input.identity,
                        strategy = %strategy.produced_by(),
                        stage = %stage,
                        error = %error,
                        "Strategy failed, falling back"
                    );
                    attempts.push(AttemptReport {
                        strategy: strategy.produced_by(),
                        outcome: AttemptOutcome::Failed {
                            stage,
                            error: error.to_string(),
                        },
                    });
                }
            }
        }

        Err(PhotoError::Internal(format!(
            "no strategy produced a reference for {}",
            input.identity
        )))
    }

    fn guard(&self, strategy: Strategy, input: &ChainInput) -> Result<(), String> {
        match strategy {
            Strategy::LocalPipeline => match self.processor {
                Some(_) => Ok(()),
                None => Err("no local processor configured".into()),
            },
            Strategy::TransformConvention => match self.transform {
                Some(ref transform) if transform.matches(&input.raw_reference) => Ok(()),
                Some(_) => Err("raw reference does not match provider pattern".into()),
                None => Err("no transform provider configured".into()),
            },
            Strategy::Passthrough => Ok(()),
        }
    }

    async fn attempt(
        &self,
        strategy: Strategy,
        input: &mut ChainInput,
    ) -> Result<String, (Stage, PhotoError)> {
        match strategy {
            Strategy::LocalPipeline => self.run_local(input).await,
            Strategy::TransformConvention => self
                .transform
                .as_ref()
                .and_then(|t| t.derive(&input.raw_reference))
                .ok_or_else(|| {
                    (
                        Stage::Resolving,
                        PhotoError::Internal("transform convention not applicable".into()),
                    )
                }),
            Strategy::Passthrough => Ok(input.raw_reference.clone()),
        }
    }

    /// Resolve, process and upload. Buffers are handed off by value so each
    /// stage's input is freed once the next stage owns its output.
    async fn run_local(&self, input: &mut ChainInput) -> Result<String, (Stage, PhotoError)> {
        let processor = self.processor.as_ref().ok_or_else(|| {
            (
                Stage::Processing,
                PhotoError::Internal("no local processor configured".into()),
            )
        })?;

        let source = match input.upload.take() {
            Some(photo) => PhotoSource::Uploaded(photo),
            None => PhotoSource::Reference(input.raw_reference.clone()),
        };
        let raw = self
            .resolver
            .resolve(source)
            .await
            .map_err(|e| (Stage::Resolving, e))?;
        let raw_size = raw.len();

        let processed = bounded(
            Stage::Processing,
            self.processing_timeout,
            processor.process(raw.bytes, self.options),
        )
        .await
        .map_err(|e| (Stage::Processing, e))?;

        let key = ObjectKey::clean(&input.identity);
        debug!(
            identity = %input.identity,
            raw_size = raw_size,
            clean_size = processed.len(),
            key = %key,
            "Uploading cleaned photo"
        );

        bounded(
            Stage::Uploading,
            self.upload_timeout,
            self.storage.upload(&key, Bytes::from(processed)),
        )
        .await
        .map_err(|e| (Stage::Uploading, e))
    }

    fn count_success(&self, strategy: Strategy) {
        let counter = match strategy {
            Strategy::LocalPipeline => &self.counters.local_pipeline,
            Strategy::TransformConvention => &self.counters.transform_convention,
            Strategy::Passthrough => &self.counters.passthrough,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failure(&self, stage: Stage) {
        let counter = match stage {
            Stage::Resolving => &self.counters.resolution_failures,
            Stage::Processing => &self.counters.processing_failures,
            Stage::Uploading => &self.counters.storage_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            runs: self.counters.runs.load(Ordering::Relaxed),
            local_pipeline: self.counters.local_pipeline.load(Ordering::Relaxed),
            transform_convention: self.counters.transform_convention.load(Ordering::Relaxed),
            passthrough: self.counters.passthrough.load(Ordering::Relaxed),
            resolution_failures: self.counters.resolution_failures.load(Ordering::Relaxed),
            processing_failures: self.counters.processing_failures.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
        }
    }
}

/// Run a stage under a deadline
async fn bounded<T, F>(stage: Stage, limit: Duration, future: F) -> Result<T, PhotoError>
where
    F: Future<Output = Result<T, PhotoError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(PhotoError::Timeout {
            stage,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MockProcessor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Object store that keeps nothing and can be told to fail
    struct RecordingStorage {
        fail: bool,
        uploads: AtomicU32,
    }

    impl RecordingStorage {
        fn healthy() -> Arc<Self> {
            Arc::new(Self { fail: false, uploads: AtomicU32::new(0) })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self { fail: true, uploads: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl ObjectStorage for RecordingStorage {
        async fn upload(&self, key: &ObjectKey, _data: Bytes) -> Result<String, PhotoError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PhotoError::StorageFailed("bucket unavailable".into()));
            }
            Ok(format!("https://store.test/{}", key))
        }
    }

    fn config(pattern: Option<&str>) -> PipelineConfig {
        PipelineConfig {
            transform_provider_pattern: pattern.map(str::to_string),
            transform_suffix: if pattern.is_some() { "?tr=e-bgremove".into() } else { String::new() },
            timeout_ms: 500,
            processing_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn chain(
        config: &PipelineConfig,
        processor: Option<Arc<dyn ImageProcessor>>,
        storage: Arc<dyn ObjectStorage>,
    ) -> FallbackChain {
        let resolver = ByteResolver::new(config.timeout(), config.max_download_bytes).unwrap();
        FallbackChain::new(config, resolver, processor, storage).unwrap()
    }

    fn uploaded(identity: &str, raw: &str) -> ChainInput {
        ChainInput::uploaded(
            identity,
            raw,
            RawPhoto::new(Bytes::from_static(b"raw-bytes"), Some("image/jpeg".into())),
        )
    }

    #[tokio::test]
    async fn test_local_pipeline_preferred() {
        let processor = Arc::new(MockProcessor::new().with_output(b"clean".to_vec()));
        let storage = RecordingStorage::healthy();
        let chain = chain(&config(None), Some(processor.clone()), storage.clone());

        let outcome = chain.run(uploaded("m-1", "https://host/photo.jpg")).await.unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::LocalPipeline);
        assert!(outcome.clean_reference.starts_with("https://store.test/clean/m-1/"));
        assert_ne!(outcome.clean_reference, "https://host/photo.jpg");
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(processor.call_count(), 1);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_processing_failure_uses_transform() {
        let processor = Arc::new(MockProcessor::new().with_failure("model crashed"));
        let chain = chain(
            &config(Some(r"^https://ik\.imagekit\.io/")),
            Some(processor),
            RecordingStorage::healthy(),
        );

        let raw = "https://ik.imagekit.io/org/m-1.jpg";
        let outcome = chain.run(uploaded("m-1", raw)).await.unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::TransformConvention);
        assert_eq!(outcome.clean_reference, format!("{}?tr=e-bgremove", raw));
        assert!(matches!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failed { stage: Stage::Processing, .. }
        ));
        assert_eq!(chain.stats().processing_failures, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_falls_back() {
        let chain = chain(
            &config(None),
            Some(Arc::new(MockProcessor::new())),
            RecordingStorage::broken(),
        );

        let outcome = chain.run(uploaded("m-1", "https://host/photo.jpg")).await.unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::Passthrough);
        assert_eq!(outcome.clean_reference, "https://host/photo.jpg");
        assert!(matches!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failed { stage: Stage::Uploading, .. }
        ));
        assert!(matches!(outcome.attempts[1].outcome, AttemptOutcome::Skipped { .. }));
        assert_eq!(chain.stats().storage_failures, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_uses_transform() {
        let chain = chain(
            &config(Some(r"^https://ik\.imagekit\.io/")),
            Some(Arc::new(MockProcessor::new())),
            RecordingStorage::broken(),
        );

        let raw = "https://ik.imagekit.io/org/m-1.jpg";
        let outcome = chain.run(uploaded("m-1", raw)).await.unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::TransformConvention);
        assert_eq!(outcome.clean_reference, format!("{}?tr=e-bgremove", raw));
        assert_eq!(outcome.attempts.len(), 2);
        assert!(matches!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failed { stage: Stage::Uploading, .. }
        ));
        assert_eq!(chain.stats().transform_convention, 1);
    }

    #[tokio::test]
    async fn test_disabled_processor_and_unknown_host() {
        let chain = chain(
            &config(Some(r"^https://ik\.imagekit\.io/")),
            None,
            RecordingStorage::healthy(),
        );

        let outcome = chain
            .run(ChainInput::reference("m-1", "https://cdn.example.org/m-1.jpg"))
            .await
            .unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::Passthrough);
        assert_eq!(outcome.clean_reference, "https://cdn.example.org/m-1.jpg");
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_slow_processor_times_out() {
        let processor = Arc::new(MockProcessor::new().with_delay(Duration::from_secs(5)));
        let chain = chain(&config(None), Some(processor), RecordingStorage::healthy());

        let started = Instant::now();
        let outcome = chain.run(uploaded("m-1", "https://host/photo.jpg")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(outcome.produced_by, ProducedBy::Passthrough);
        match &outcome.attempts[0].outcome {
            AttemptOutcome::Failed { stage, error } => {
                assert_eq!(*stage, Stage::Processing);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_raw_reference() {
        let chain = chain(
            &config(None),
            Some(Arc::new(MockProcessor::new())),
            RecordingStorage::healthy(),
        );

        let outcome = chain
            .run(ChainInput::reference("m-1", "ftp://host/photo.jpg"))
            .await
            .unwrap();
        assert_eq!(outcome.produced_by, ProducedBy::Passthrough);
        assert_eq!(chain.stats().resolution_failures, 1);
        assert_eq!(chain.stats().runs, 1);
        assert_eq!(chain.stats().passthrough, 1);
    }

    #[tokio::test]
    async fn test_empty_raw_reference_rejected() {
        let chain = chain(&config(None), None, RecordingStorage::healthy());
        let result = chain.run(ChainInput::reference("m-1", "  ")).await;
        assert!(matches!(result, Err(PhotoError::InvalidInput(_))));
        assert_eq!(chain.stats().runs, 0);
    }

    #[test]
    fn test_attempt_report_json() {
        let report = AttemptReport {
            strategy: ProducedBy::LocalPipeline,
            outcome: AttemptOutcome::Failed {
                stage: Stage::Resolving,
                error: "404".into(),
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["strategy"], "local-pipeline");
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["stage"], "resolving");
    }
}
