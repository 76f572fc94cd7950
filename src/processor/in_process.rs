//! In-process cleaning on the blocking thread pool

use super::{clean_photo, BorderKeySegmenter, ImageProcessor, ProcessOptions, Segmenter};
use crate::error::PhotoError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Decodes, segments and composites inside this process
pub struct InProcessProcessor {
    segmenter: Arc<dyn Segmenter>,
}

impl Default for InProcessProcessor {
    fn default() -> Self {
        Self::with_segmenter(Arc::new(BorderKeySegmenter::default()))
    }
}

impl InProcessProcessor {
    pub fn with_segmenter(segmenter: Arc<dyn Segmenter>) -> Self {
        Self { segmenter }
    }
}

#[async_trait]
impl ImageProcessor for InProcessProcessor {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn process(&self, input: Bytes, options: ProcessOptions) -> Result<Vec<u8>, PhotoError> {
        let segmenter = self.segmenter.clone();
        let input_len = input.len();

        let output = tokio::task::spawn_blocking(move || {
            clean_photo(&input, &options, segmenter.as_ref())
        })
        .await
        .map_err(|e| PhotoError::ProcessingFailed(format!("worker task failed: {}", e)))??;

        debug!(input = input_len, output = output.len(), "Cleaned photo in process");
        Ok(output)
    }
}
