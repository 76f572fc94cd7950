//! Configuration for idcard-photo

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::PhotoError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("idcard-photo")
}

/// Solid canvas colour the cleaned subject is composited onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanvasColor(pub [u8; 4]);

impl CanvasColor {
    /// Tailwind blue-50, the ID card background
    pub const CARD_BLUE: CanvasColor = CanvasColor([239, 246, 255, 255]);

    pub fn rgba(&self) -> [u8; 4] {
        self.0
    }
}

impl Default for CanvasColor {
    fn default() -> Self {
        Self::CARD_BLUE
    }
}

impl FromStr for CanvasColor {
    type Err = PhotoError;

    /// Parses `#rrggbb` or `#rrggbbaa`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        let bytes = hex::decode(digits)
            .map_err(|e| PhotoError::Config(format!("Invalid canvas color '{}': {}", s, e)))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(CanvasColor([*r, *g, *b, 255])),
            [r, g, b, a] => Ok(CanvasColor([*r, *g, *b, *a])),
            _ => Err(PhotoError::Config(format!(
                "Invalid canvas color '{}': expected #rrggbb or #rrggbbaa",
                s
            ))),
        }
    }
}

impl TryFrom<String> for CanvasColor {
    type Error = PhotoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CanvasColor> for String {
    fn from(color: CanvasColor) -> Self {
        color.to_string()
    }
}

impl fmt::Display for CanvasColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", hex::encode(self.0))
    }
}

/// Options for the photo cleaning pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Neither side of a cleaned photo exceeds this many pixels
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// Background the subject is composited onto
    #[serde(default)]
    pub canvas_color: CanvasColor,

    /// Regex a raw URL must match for the transform convention to apply
    #[serde(default)]
    pub transform_provider_pattern: Option<String>,

    /// Suffix appended to matching raw URLs
    #[serde(default)]
    pub transform_suffix: String,

    /// Bound on download and upload, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on local processing, in milliseconds
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Largest raw photo the resolver will accept
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    /// Run at most one chain per identity at a time
    #[serde(default = "default_true")]
    pub serialize_per_record: bool,
}

fn default_max_dimension() -> u32 {
    800
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_processing_timeout_ms() -> u64 {
    60_000
}

fn default_max_download_bytes() -> u64 {
    15 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            canvas_color: CanvasColor::default(),
            transform_provider_pattern: None,
            transform_suffix: String::new(),
            timeout_ms: default_timeout_ms(),
            processing_timeout_ms: default_processing_timeout_ms(),
            max_download_bytes: default_max_download_bytes(),
            serialize_per_record: true,
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), PhotoError> {
        if self.max_dimension == 0 {
            return Err(PhotoError::Config("max_dimension must be positive".into()));
        }
        if self.timeout_ms == 0 || self.processing_timeout_ms == 0 {
            return Err(PhotoError::Config("timeouts must be positive".into()));
        }
        if self.transform_provider_pattern.is_some() && self.transform_suffix.is_empty() {
            return Err(PhotoError::Config(
                "transform_suffix is required when transform_provider_pattern is set".into(),
            ));
        }
        Ok(())
    }
}

/// Which local background-removal processor to use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorConfig {
    /// Border-keyed segmentation inside this process
    #[default]
    InProcess,
    /// External worker reading raw bytes on stdin and writing PNG on stdout.
    /// Arguments may use `{max_dimension}` and `{canvas_color}` placeholders.
    Subprocess {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// No local processing; the chain starts at the transform convention
    Disabled,
}

/// Where cleaned photos are stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Files under `<storage_dir>/objects`, served by this daemon at `public_base_url`
    Local {
        #[serde(default = "default_public_base_url")]
        public_base_url: String,
    },
    /// Remote object store accepting `PUT <upload_url>/<key>`
    Remote {
        upload_url: String,
        public_base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

fn default_public_base_url() -> String {
    format!("http://localhost:{}/files", default_http_port())
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            public_base_url: default_public_base_url(),
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for records and local objects
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_http_port() -> u16 {
    8095
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            pipeline: PipelineConfig::default(),
            processor: ProcessorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get local objects directory
    pub fn objects_dir(&self) -> PathBuf {
        self.storage_dir.join("objects")
    }

    /// Get record database path
    pub fn records_db_path(&self) -> PathBuf {
        self.storage_dir.join("records.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
