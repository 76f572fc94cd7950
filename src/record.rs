//! Photo record carried on a member's ID card

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which strategy produced the current clean reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducedBy {
    /// Downloaded, cleaned locally and stored as a new object
    LocalPipeline,
    /// Raw URL rewritten to ask the hosting provider for a cleaned variant
    TransformConvention,
    /// Raw photo used unchanged
    Passthrough,
}

impl ProducedBy {
    /// Whether the image was actually cleaned by this system
    pub fn is_fully_cleaned(&self) -> bool {
        matches!(self, ProducedBy::LocalPipeline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProducedBy::LocalPipeline => "local-pipeline",
            ProducedBy::TransformConvention => "transform-convention",
            ProducedBy::Passthrough => "passthrough",
        }
    }
}

impl fmt::Display for ProducedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Photo fields of a membership ID card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Owning member
    pub identity: String,
    /// Original photo as supplied by the caller
    pub raw_reference: Option<String>,
    /// Best available derivative; set after the first pipeline run
    pub clean_reference: Option<String>,
    pub produced_by: Option<ProducedBy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoRecord {
    /// Empty record, as created alongside the owning entity
    pub fn empty(identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            identity: identity.into(),
            raw_reference: None,
            clean_reference: None,
            produced_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a whole-field write
    pub fn apply(&mut self, fields: PhotoFields) {
        if let Some(raw) = fields.raw_reference {
            self.raw_reference = Some(raw);
        }
        if let Some(clean) = fields.clean_reference {
            self.clean_reference = Some(clean);
        }
        if let Some(produced_by) = fields.produced_by {
            self.produced_by = Some(produced_by);
        }
        self.updated_at = Utc::now();
    }

    /// Whether the photo on file went through the local pipeline
    pub fn is_fully_cleaned(&self) -> bool {
        self.produced_by.map(|p| p.is_fully_cleaned()).unwrap_or(false)
    }
}

/// Fields written to a record in one update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFields {
    pub raw_reference: Option<String>,
    pub clean_reference: Option<String>,
    pub produced_by: Option<ProducedBy>,
}

impl PhotoFields {
    /// A raw photo together with the outcome of a run on it
    pub fn submitted(
        raw_reference: impl Into<String>,
        clean_reference: impl Into<String>,
        produced_by: ProducedBy,
    ) -> Self {
        Self {
            raw_reference: Some(raw_reference.into()),
            clean_reference: Some(clean_reference.into()),
            produced_by: Some(produced_by),
        }
    }

    /// Result of a pipeline run
    pub fn cleaned(clean_reference: impl Into<String>, produced_by: ProducedBy) -> Self {
        Self {
            raw_reference: None,
            clean_reference: Some(clean_reference.into()),
            produced_by: Some(produced_by),
        }
    }
}
