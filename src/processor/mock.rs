//! Mock processor for testing

use super::{ImageProcessor, ProcessOptions};
use crate::error::PhotoError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Processor with scripted behaviour. By default it echoes its input.
pub struct MockProcessor {
    output: Option<Vec<u8>>,
    failure: Option<String>,
    delay: Option<Duration>,
    call_count: AtomicU32,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self {
            output: None,
            failure: None,
            delay: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Return these bytes instead of the input
    pub fn with_output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Fail every call with `ProcessingFailed`
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProcessor for MockProcessor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn process(&self, input: Bytes, _options: ProcessOptions) -> Result<Vec<u8>, PhotoError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref message) = self.failure {
            return Err(PhotoError::ProcessingFailed(message.clone()));
        }
        Ok(self.output.clone().unwrap_or_else(|| input.to_vec()))
    }
}
