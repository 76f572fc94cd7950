//! Transform convention - ask the photo's host for a cleaned variant
//!
//! Some image hosts serve a background-removed rendition when a suffix is
//! appended to the original URL. The derived URL is not fetched or checked;
//! the host does the work when the card is rendered.

use crate::config::PipelineConfig;
use crate::error::PhotoError;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct TransformConvention {
    pattern: Regex,
    suffix: String,
}

impl TransformConvention {
    pub fn new(pattern: &str, suffix: impl Into<String>) -> Result<Self, PhotoError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| PhotoError::Config(format!("Invalid transform_provider_pattern: {}", e)))?;
        Ok(Self {
            pattern,
            suffix: suffix.into(),
        })
    }

    /// `None` when no provider pattern is configured
    pub fn from_config(config: &PipelineConfig) -> Result<Option<Self>, PhotoError> {
        match config.transform_provider_pattern.as_deref() {
            Some(pattern) if !pattern.is_empty() => {
                Ok(Some(Self::new(pattern, config.transform_suffix.clone())?))
            }
            _ => Ok(None),
        }
    }

    /// Whether the raw URL is hosted by the transform-capable provider
    pub fn matches(&self, raw_reference: &str) -> bool {
        self.pattern.is_match(raw_reference)
    }

    /// Cleaned-variant URL for a matching raw URL
    pub fn derive(&self, raw_reference: &str) -> Option<String> {
        self.matches(raw_reference)
            .then(|| derive_transformed_url(raw_reference, &self.suffix))
    }
}

/// Append the provider suffix to the raw URL
pub fn derive_transformed_url(raw_reference: &str, suffix: &str) -> String {
    format!("{}{}", raw_reference, suffix)
}
