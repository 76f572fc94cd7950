//! Object storage for cleaned and staged photos
//!
//! Two backends share the [`ObjectStorage`] trait:
//!
//! - [`LocalObjectStore`] writes objects below a root directory and hands out
//!   URLs under a public base that this daemon serves (`GET /files/{key}`).
//! - [`HttpObjectStore`] PUTs objects to a remote store and composes the
//!   public URL from its configured base (or the store's `url` reply).
//!
//! Keys are never reused: cleaned derivatives get a timestamp + UUID key, and
//! staged raw uploads are content-addressed, so re-processing never clobbers
//! an object a record may still point at.

use crate::error::PhotoError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Key of an object in storage, e.g. `clean/member-1/20250101T000000-<uuid>.png`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Fresh key for a cleaned derivative
    pub fn clean(identity: &str) -> Self {
        Self(format!(
            "clean/{}/{}-{}.png",
            sanitize_segment(identity),
            Utc::now().format("%Y%m%dT%H%M%S"),
            uuid::Uuid::new_v4()
        ))
    }

    /// Content-addressed key for staged raw bytes
    pub fn raw(identity: &str, data: &[u8], extension: &str) -> Self {
        Self(format!(
            "raw/{}/{}.{}",
            sanitize_segment(identity),
            compute_hash(data),
            extension
        ))
    }

    /// Parse a key received from outside (e.g. an HTTP path)
    pub fn parse(key: &str) -> Result<Self, PhotoError> {
        let trimmed = key.trim_matches('/');
        if trimmed.is_empty() {
            return Err(PhotoError::InvalidInput("empty object key".into()));
        }
        let valid = Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !valid || trimmed.contains('\\') {
            return Err(PhotoError::InvalidInput(format!("invalid object key: {}", key)));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content type implied by the key's extension
    pub fn content_type(&self) -> &'static str {
        match self.0.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            Some("gif") => "image/gif",
            _ => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn join_url(base: &str, key: &ObjectKey) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.as_str())
}

/// Object storage collaborator
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Persist bytes under `key`, returning a publicly resolvable URI
    async fn upload(&self, key: &ObjectKey, data: Bytes) -> Result<String, PhotoError>;

    /// Read an object this store owns, addressed by its public URI.
    /// `Ok(None)` means the URI is not one of ours.
    async fn read_owned(&self, _uri: &str) -> Result<Option<Bytes>, PhotoError> {
        Ok(None)
    }
}

/// Filesystem-backed object store
pub struct LocalObjectStore {
    root_dir: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    /// Create a store rooted at the given directory
    pub async fn new<P: AsRef<Path>>(
        root_dir: P,
        public_base_url: impl Into<String>,
    ) -> Result<Self, PhotoError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();
        info!(path = %root_dir.display(), base = %public_base_url, "Initialized object store");

        Ok(Self {
            root_dir,
            public_base_url,
        })
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.root_dir.join(key.as_str())
    }

    /// Public URI for a key
    pub fn public_url(&self, key: &ObjectKey) -> String {
        join_url(&self.public_base_url, key)
    }

    /// Key behind one of our public URIs
    pub fn key_for_url(&self, uri: &str) -> Option<ObjectKey> {
        let rest = uri.strip_prefix(&self.public_base_url)?.strip_prefix('/')?;
        ObjectKey::parse(rest).ok()
    }

    /// Retrieve an object by key
    pub async fn get(&self, key: &ObjectKey) -> Result<Bytes, PhotoError> {
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PhotoError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an object exists
    pub async fn exists(&self, key: &ObjectKey) -> bool {
        fs::metadata(self.object_path(key)).await.is_ok()
    }

    async fn write(&self, key: &ObjectKey, data: &[u8]) -> Result<(), PhotoError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so a published URL never sees a partial file
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, data).await?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            fs::remove_file(&tmp_path).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStore {
    async fn upload(&self, key: &ObjectKey, data: Bytes) -> Result<String, PhotoError> {
        if self.exists(key).await {
            debug!(key = %key, "Object already exists");
            return Ok(self.public_url(key));
        }

        self.write(key, &data)
            .await
            .map_err(|e| PhotoError::StorageFailed(format!("{}: {}", key, e)))?;

        info!(key = %key, size = data.len(), "Stored object");
        Ok(self.public_url(key))
    }

    async fn read_owned(&self, uri: &str) -> Result<Option<Bytes>, PhotoError> {
        match self.key_for_url(uri) {
            Some(key) => self.get(&key).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Remote object store reached over HTTP
pub struct HttpObjectStore {
    client: reqwest::Client,
    upload_url: String,
    public_base_url: String,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        upload_url: impl Into<String>,
        public_base_url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PhotoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhotoError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            upload_url: upload_url.into(),
            public_base_url: public_base_url.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStore {
    async fn upload(&self, key: &ObjectKey, data: Bytes) -> Result<String, PhotoError> {
        let url = join_url(&self.upload_url, key);
        let size = data.len();

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, key.content_type())
            .body(data);
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PhotoError::StorageFailed(format!("PUT {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PhotoError::StorageFailed(format!("PUT {} returned {}", url, status)));
        }

        // Stores may answer with the canonical public URL
        let body = response.bytes().await.unwrap_or_default();
        let reported = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("url").and_then(|u| u.as_str()).map(str::to_string))
            .filter(|u| !u.is_empty());

        let public = reported.unwrap_or_else(|| join_url(&self.public_base_url, key));
        info!(key = %key, size = size, url = %public, "Uploaded object");
        Ok(public)
    }
}
