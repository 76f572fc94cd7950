//! Byte resolver - turns a raw photo reference into bytes
//!
//! Single attempt, bounded by a timeout and a size limit. The fallback chain,
//! not an internal retry, absorbs failures.

use crate::error::{PhotoError, Stage};
use crate::storage::ObjectStorage;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Raw photo bytes plus the content type they arrived with
#[derive(Debug, Clone)]
pub struct RawPhoto {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

impl RawPhoto {
    pub fn new(bytes: Bytes, content_type: Option<String>) -> Self {
        Self { bytes, content_type }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File extension for staging, from the sniffed format or the content type
    pub fn extension(&self) -> &'static str {
        if let Ok(format) = image::guess_format(&self.bytes) {
            if let Some(&ext) = format.extensions_str().first() {
                return ext;
            }
        }
        match self.content_type.as_deref() {
            Some("image/png") => "png",
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ => "bin",
        }
    }
}

/// Where the raw bytes come from
#[derive(Debug, Clone)]
pub enum PhotoSource {
    /// Fetch from a URI
    Reference(String),
    /// Caller already handed the bytes over
    Uploaded(RawPhoto),
}

/// Resolves photo sources into memory
pub struct ByteResolver {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
    /// Store consulted first for URIs it owns
    local: Option<Arc<dyn ObjectStorage>>,
}

impl ByteResolver {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, PhotoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhotoError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            max_bytes,
            local: None,
        })
    }

    /// Read URIs owned by this store directly instead of over the network
    pub fn with_local_store(mut self, store: Arc<dyn ObjectStorage>) -> Self {
        self.local = Some(store);
        self
    }

    /// Resolve a source into bytes, bounded by the configured timeout
    pub async fn resolve(&self, source: PhotoSource) -> Result<RawPhoto, PhotoError> {
        match source {
            PhotoSource::Uploaded(photo) => {
                self.check_size(photo.len() as u64)?;
                Ok(photo)
            }
            PhotoSource::Reference(uri) => {
                match tokio::time::timeout(self.timeout, self.fetch(&uri)).await {
                    Ok(result) => result,
                    Err(_) => Err(PhotoError::Timeout {
                        stage: Stage::Resolving,
                        after_ms: self.timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }

    async fn fetch(&self, uri: &str) -> Result<RawPhoto, PhotoError> {
        if let Some(ref store) = self.local {
            match store.read_owned(uri).await {
                Ok(Some(bytes)) => {
                    self.check_size(bytes.len() as u64)?;
                    debug!(uri = %uri, size = bytes.len(), "Resolved from local object store");
                    return Ok(RawPhoto::new(bytes, None));
                }
                Ok(None) => {}
                Err(e) => return Err(PhotoError::ResolutionFailed(format!("{}: {}", uri, e))),
            }
        }

        let parsed = url::Url::parse(uri)
            .map_err(|e| PhotoError::ResolutionFailed(format!("invalid URI '{}': {}", uri, e)))?;

        match parsed.scheme() {
            "http" | "https" => self.fetch_http(uri).await,
            "file" => {
                let path = parsed.to_file_path().map_err(|_| {
                    PhotoError::ResolutionFailed(format!("invalid file URI '{}'", uri))
                })?;
                self.fetch_file(&path).await
            }
            other => Err(PhotoError::ResolutionFailed(format!(
                "unsupported scheme '{}' in '{}'",
                other, uri
            ))),
        }
    }

    async fn fetch_http(&self, uri: &str) -> Result<RawPhoto, PhotoError> {
        let mut response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| PhotoError::ResolutionFailed(format!("GET {}: {}", uri, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PhotoError::ResolutionFailed(format!("GET {} returned {}", uri, status)));
        }

        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        // Content-Length can be absent or wrong; enforce the limit while reading
        let mut buffer = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PhotoError::ResolutionFailed(format!("reading {}: {}", uri, e)))?
        {
            self.check_size((buffer.len() + chunk.len()) as u64)?;
            buffer.extend_from_slice(&chunk);
        }

        if buffer.is_empty() {
            return Err(PhotoError::ResolutionFailed(format!("GET {} returned no body", uri)));
        }

        debug!(uri = %uri, size = buffer.len(), "Downloaded raw photo");
        Ok(RawPhoto::new(buffer.freeze(), content_type))
    }

    async fn fetch_file(&self, path: &std::path::Path) -> Result<RawPhoto, PhotoError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PhotoError::ResolutionFailed(format!("{}: {}", path.display(), e)))?;

        // Read one byte past the limit to detect oversized files
        let mut data = Vec::new();
        file.take(self.max_bytes + 1)
            .read_to_end(&mut data)
            .await
            .map_err(|e| PhotoError::ResolutionFailed(format!("{}: {}", path.display(), e)))?;
        self.check_size(data.len() as u64)?;

        if data.is_empty() {
            return Err(PhotoError::ResolutionFailed(format!("{} is empty", path.display())));
        }
        Ok(RawPhoto::new(Bytes::from(data), None))
    }

    fn check_size(&self, size: u64) -> Result<(), PhotoError> {
        if size > self.max_bytes {
            return Err(PhotoError::ResolutionFailed(format!(
                "photo is {} bytes, limit is {}",
                size, self.max_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver() -> ByteResolver {
        ByteResolver::new(Duration::from_secs(5), 1024).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/photo.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg; charset=binary")
                    .set_body_bytes(vec![7u8; 100]),
            )
            .mount(&server)
            .await;

        let photo = resolver()
            .resolve(PhotoSource::Reference(format!("{}/photo.jpg", server.uri())))
            .await
            .unwrap();
        assert_eq!(photo.len(), 100);
        assert_eq!(photo.content_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = resolver()
            .resolve(PhotoSource::Reference(format!("{}/missing.jpg", server.uri())))
            .await;
        assert!(matches!(result, Err(PhotoError::ResolutionFailed(_))));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let result = resolver()
            .resolve(PhotoSource::Reference(format!("{}/big.jpg", server.uri())))
            .await;
        assert!(matches!(result, Err(PhotoError::ResolutionFailed(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 10])
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let resolver = ByteResolver::new(Duration::from_millis(100), 1024).unwrap();
        let result = resolver
            .resolve(PhotoSource::Reference(format!("{}/slow.jpg", server.uri())))
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.stage_class(), Some(Stage::Resolving));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let result = resolver()
            .resolve(PhotoSource::Reference("ftp://host/photo.jpg".into()))
            .await;
        assert!(matches!(result, Err(PhotoError::ResolutionFailed(_))));
    }

    #[tokio::test]
    async fn test_file_uri() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let file = temp_dir.path().join("photo.bin");
        std::fs::write(&file, vec![3u8; 64]).unwrap();
        let uri = url::Url::from_file_path(&file).unwrap().to_string();

        let photo = resolver().resolve(PhotoSource::Reference(uri)).await.unwrap();
        assert_eq!(photo.len(), 64);

        std::fs::write(&file, vec![3u8; 2048]).unwrap();
        let uri = url::Url::from_file_path(&file).unwrap().to_string();
        assert!(resolver().resolve(PhotoSource::Reference(uri)).await.is_err());
    }

    #[tokio::test]
    async fn test_uploaded_passes_through() {
        let photo = RawPhoto::new(Bytes::from_static(b"abc"), Some("image/png".into()));
        let resolved = resolver().resolve(PhotoSource::Uploaded(photo)).await.unwrap();
        assert_eq!(resolved.bytes, Bytes::from_static(b"abc"));
        assert_eq!(resolved.extension(), "png");
    }
}
