//! idcard-photo - Member ID-card photo cleaning
//!
//! Takes a raw member photo (URL or uploaded bytes), removes the background,
//! composites the subject onto the card colour and stores the result. When
//! any stage fails the pipeline degrades instead of erroring:
//!
//! | Strategy | Produces | When |
//! |----------|----------|------|
//! | local-pipeline | newly stored PNG | download, processing and upload all succeed |
//! | transform-convention | raw URL + provider suffix | raw URL matches the configured provider |
//! | passthrough | raw URL unchanged | always |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/idcard-photo/
//! ├── objects/               # Local object store (served at /files/)
//! │   ├── raw/<identity>/    # Staged uploads, content-addressed
//! │   └── clean/<identity>/  # Cleaned derivatives, one per run
//! ├── records.sled/          # Photo records
//! └── config.toml            # Configuration
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod http;
pub mod processor;
pub mod record;
pub mod record_store;
pub mod resolver;
pub mod service;
pub mod storage;
pub mod transform;

// Re-exports
pub use chain::{AttemptOutcome, AttemptReport, ChainInput, ChainOutcome, ChainStats, FallbackChain, Strategy};
pub use config::{CanvasColor, Config, PipelineConfig, ProcessorConfig, StorageConfig};
pub use error::{PhotoError, Stage};
pub use http::HttpServer;
pub use processor::{ImageProcessor, InProcessProcessor, ProcessOptions, SubprocessProcessor};
pub use record::{PhotoFields, PhotoRecord, ProducedBy};
pub use record_store::{MemoryRecordStore, RecordStore, SledRecordStore};
pub use resolver::{ByteResolver, PhotoSource, RawPhoto};
pub use service::{CleanedPhoto, PhotoService, RecleanResult};
pub use storage::{HttpObjectStore, LocalObjectStore, ObjectKey, ObjectStorage};
pub use transform::{derive_transformed_url, TransformConvention};
