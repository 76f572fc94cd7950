//! HTTP API for the photo pipeline
//!
//! Thin adapter over [`PhotoService`]:
//!
//! ## Photo API
//! - `GET /photos/{identity}` - Current photo record
//! - `PUT /photos/{identity}` - Submit a raw photo URL (`{"raw_reference": "..."}`)
//! - `POST /photos/{identity}/upload` - Submit raw photo bytes as the body
//! - `POST /photos/{identity}/reclean` - Re-run the fallback chain
//! - `DELETE /photos/{identity}` - Forget the photo record
//!
//! ## Diagnostics
//! - `GET /health` - Health check
//! - `GET /stats` - Per-strategy counters
//!
//! ## Files
//! - `GET /files/{key}` - Objects of the local object store
//!
//! ## Example Usage
//!
//! ```bash
//! # Submit a hosted photo
//! curl -X PUT -H "Content-Type: application/json" \
//!      -d '{"raw_reference": "https://host/photo.jpg"}' \
//!      http://localhost:8095/photos/member-42
//!
//! # Upload a photo from disk
//! curl -X POST -H "Content-Type: image/jpeg" \
//!      --data-binary @photo.jpg \
//!      http://localhost:8095/photos/member-42/upload
//! ```

use crate::error::PhotoError;
use crate::service::PhotoService;
use crate::storage::ObjectKey;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Routes understood by the server
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Stats,
    GetPhoto(&'a str),
    SubmitPhoto(&'a str),
    UploadPhoto(&'a str),
    RecleanPhoto(&'a str),
    ForgetPhoto(&'a str),
    File(&'a str),
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    if path == "/health" && *method == Method::GET {
        return Route::Health;
    }
    if path == "/stats" && *method == Method::GET {
        return Route::Stats;
    }
    if let Some(key) = path.strip_prefix("/files/") {
        if *method == Method::GET {
            return Route::File(key);
        }
        return Route::NotFound;
    }

    let Some(rest) = path.strip_prefix("/photos/") else {
        return Route::NotFound;
    };
    let mut segments = rest.split('/');
    let identity = segments.next().unwrap_or("");
    let action = segments.next();
    if identity.is_empty() || segments.next().is_some() {
        return Route::NotFound;
    }

    match (method.clone(), action) {
        (Method::GET, None) => Route::GetPhoto(identity),
        (Method::PUT, None) => Route::SubmitPhoto(identity),
        (Method::DELETE, None) => Route::ForgetPhoto(identity),
        (Method::POST, Some("upload")) => Route::UploadPhoto(identity),
        (Method::POST, Some("reclean")) => Route::RecleanPhoto(identity),
        _ => Route::NotFound,
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    raw_reference: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>, PhotoError> {
    let body = serde_json::to_vec(value)?;
    Ok(respond(status, "application/json", body))
}

fn status_for(error: &PhotoError) -> StatusCode {
    match error {
        PhotoError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PhotoError::NotFound(_) => StatusCode::NOT_FOUND,
        PhotoError::StorageFailed(_) => StatusCode::BAD_GATEWAY,
        PhotoError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP server state
pub struct HttpServer {
    service: PhotoService,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(service: PhotoService, bind_addr: SocketAddr) -> Self {
        Self { service, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), PhotoError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match route(&method, &path) {
            Route::Health => self.handle_health(),
            Route::Stats => json(StatusCode::OK, &self.service.stats()),
            Route::File(key) => self.handle_file(key).await,
            Route::NotFound => Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
            photo_route => self.handle_photo(req, photo_route).await,
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!(error = %e, path = %path, "Request error");
                }
                let body = ErrorBody { error: e.to_string() };
                Ok(match serde_json::to_vec(&body) {
                    Ok(bytes) => respond(status, "application/json", bytes),
                    Err(_) => respond(status, "text/plain", e.to_string()),
                })
            }
        }
    }

    /// Health check endpoint
    fn handle_health(&self) -> Result<Response<Full<Bytes>>, PhotoError> {
        let stats = self.service.stats();
        let body = serde_json::json!({
            "status": "ok",
            "runs": stats.runs,
            "local_files": self.service.local_files().is_some(),
        });
        Ok(respond(StatusCode::OK, "application/json", body.to_string()))
    }

    /// /photos/{identity} routes
    async fn handle_photo(
        &self,
        req: Request<Incoming>,
        route: Route<'_>,
    ) -> Result<Response<Full<Bytes>>, PhotoError> {
        match route {
            Route::GetPhoto(identity) => {
                let record = self.service.get_photo(&decode_identity(identity)?).await?;
                json(StatusCode::OK, &record)
            }
            Route::SubmitPhoto(identity) => self.handle_submit(req, &decode_identity(identity)?).await,
            Route::UploadPhoto(identity) => self.handle_upload(req, &decode_identity(identity)?).await,
            Route::RecleanPhoto(identity) => {
                let cleaned = self.service.reclean_photo(&decode_identity(identity)?).await?;
                json(StatusCode::OK, &cleaned)
            }
            Route::ForgetPhoto(identity) => {
                self.service.forget_photo(&decode_identity(identity)?).await?;
                Ok(respond(StatusCode::NO_CONTENT, "text/plain", Bytes::new()))
            }
            _ => Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
        }
    }

    /// PUT /photos/{identity}
    async fn handle_submit(
        &self,
        req: Request<Incoming>,
        identity: &str,
    ) -> Result<Response<Full<Bytes>>, PhotoError> {
        let body = read_body(req).await?;
        let request: SubmitRequest = serde_json::from_slice(&body)
            .map_err(|e| PhotoError::InvalidInput(format!("expected {{\"raw_reference\": ...}}: {}", e)))?;

        let cleaned = self
            .service
            .submit_raw_photo(identity, &request.raw_reference)
            .await?;
        json(StatusCode::OK, &cleaned)
    }

    /// POST /photos/{identity}/upload
    async fn handle_upload(
        &self,
        req: Request<Incoming>,
        identity: &str,
    ) -> Result<Response<Full<Bytes>>, PhotoError> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(req).await?;

        let cleaned = self
            .service
            .submit_uploaded_photo(identity, body, content_type)
            .await?;
        json(StatusCode::CREATED, &cleaned)
    }

    /// GET /files/{key}
    async fn handle_file(&self, key: &str) -> Result<Response<Full<Bytes>>, PhotoError> {
        let Some(files) = self.service.local_files() else {
            return Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"));
        };

        let key = ObjectKey::parse(key)?;
        let data = files.get(&key).await?;
        debug!(key = %key, size = data.len(), "Serving object");

        let mut response = respond(StatusCode::OK, key.content_type(), data);
        // Keys are never reused
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
        Ok(response)
    }
}

/// Identity from a percent-encoded path segment
fn decode_identity(segment: &str) -> Result<Cow<'_, str>, PhotoError> {
    urlencoding::decode(segment)
        .map_err(|e| PhotoError::InvalidInput(format!("identity is not valid UTF-8: {}", e)))
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, PhotoError> {
    let body = req
        .collect()
        .await
        .map_err(|e| PhotoError::InvalidInput(format!("Failed to read body: {}", e)))?;
    Ok(body.to_bytes())
}
