//! End-to-end runs of the photo service against a mock photo host

use bytes::Bytes;
use idcard_photo::processor::MockProcessor;
use idcard_photo::{
    AttemptOutcome, HttpObjectStore, ImageProcessor, InProcessProcessor, LocalObjectStore,
    MemoryRecordStore, PhotoService, PipelineConfig, ProducedBy, RecordStore, Stage,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FILES: &str = "http://localhost:8095/files";
const CARD_BLUE: [u8; 4] = [239, 246, 255, 255];

/// White studio backdrop with a dark red subject in the middle
fn portrait(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let inside = x > width / 4 && x < width * 3 / 4 && y > height / 4 && y < height * 3 / 4;
        if inside {
            Rgb([180, 30, 30])
        } else {
            Rgb([250, 250, 250])
        }
    })
}

fn encode(image: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buffer), format)
        .unwrap();
    buffer
}

struct Harness {
    service: PhotoService,
    store: Arc<LocalObjectStore>,
    records: Arc<MemoryRecordStore>,
    _dir: TempDir,
}

impl Harness {
    async fn new(pipeline: PipelineConfig, processor: Option<Arc<dyn ImageProcessor>>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), FILES).await.unwrap());
        let records = Arc::new(MemoryRecordStore::new());
        let service =
            PhotoService::new(&pipeline, records.clone(), store.clone(), processor).unwrap();
        Self {
            service,
            store,
            records,
            _dir: dir,
        }
    }

    async fn healthy(pipeline: PipelineConfig) -> Self {
        Self::new(pipeline, Some(Arc::new(InProcessProcessor::default()))).await
    }

    /// Decode an object this harness stored
    async fn fetch_image(&self, uri: &str) -> DynamicImage {
        let key = self.store.key_for_url(uri).expect("not a local object");
        let data = self.store.get(&key).await.unwrap();
        assert_eq!(image::guess_format(&data).unwrap(), ImageFormat::Png);
        image::load_from_memory(&data).unwrap()
    }
}

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        timeout_ms: 2_000,
        processing_timeout_ms: 10_000,
        ..Default::default()
    }
}

async fn host_photo(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_healthy_pipeline_stores_new_object() {
    let server = MockServer::start().await;
    host_photo(&server, "/photo.jpg", encode(portrait(1200, 900), ImageFormat::Jpeg)).await;

    let harness = Harness::healthy(pipeline()).await;
    let raw = format!("{}/photo.jpg", server.uri());
    let cleaned = harness.service.submit_raw_photo("member-1", &raw).await.unwrap();

    let record = &cleaned.record;
    assert_eq!(record.produced_by, Some(ProducedBy::LocalPipeline));
    assert_eq!(record.raw_reference.as_deref(), Some(raw.as_str()));
    let clean = record.clean_reference.clone().unwrap();
    assert_ne!(clean, raw);
    assert!(clean.starts_with(&format!("{}/clean/member-1/", FILES)));

    let image = harness.fetch_image(&clean).await.into_rgba8();
    assert_eq!(image.dimensions(), (800, 600));
    assert_eq!(image.get_pixel(0, 0).0, CARD_BLUE);
    assert_eq!(image.get_pixel(799, 599).0, CARD_BLUE);
    let subject = image.get_pixel(400, 300).0;
    assert!(subject[0] > 140 && subject[1] < 80, "{:?}", subject);

    let stored = harness.records.get("member-1").await.unwrap().unwrap();
    assert_eq!(&stored, record);
}

#[tokio::test]
async fn test_processing_failure_uses_transform_convention() {
    let server = MockServer::start().await;
    host_photo(&server, "/org/member-2.jpg", encode(portrait(100, 100), ImageFormat::Jpeg)).await;

    let config = PipelineConfig {
        transform_provider_pattern: Some(format!("^{}/org/", regex::escape(&server.uri()))),
        transform_suffix: "?tr=e-bgremove".into(),
        ..pipeline()
    };
    let processor = Arc::new(MockProcessor::new().with_failure("segmentation model crashed"));
    let harness = Harness::new(config, Some(processor.clone())).await;

    let raw = format!("{}/org/member-2.jpg", server.uri());
    let cleaned = harness.service.submit_raw_photo("member-2", &raw).await.unwrap();

    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::TransformConvention));
    assert_eq!(
        cleaned.record.clean_reference,
        Some(format!("{}?tr=e-bgremove", raw))
    );
    assert_eq!(processor.call_count(), 1);
    assert!(matches!(
        cleaned.attempts[0].outcome,
        AttemptOutcome::Failed { stage: Stage::Processing, .. }
    ));
}

#[tokio::test]
async fn test_missing_photo_uses_transform_convention() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/org/member-6.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = PipelineConfig {
        transform_provider_pattern: Some(format!("^{}/org/", regex::escape(&server.uri()))),
        transform_suffix: "?tr=e-bgremove".into(),
        ..pipeline()
    };
    let processor = Arc::new(MockProcessor::new());
    let harness = Harness::new(config, Some(processor.clone())).await;

    let raw = format!("{}/org/member-6.jpg", server.uri());
    let cleaned = harness.service.submit_raw_photo("member-6", &raw).await.unwrap();

    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::TransformConvention));
    assert_eq!(
        cleaned.record.clean_reference,
        Some(format!("{}?tr=e-bgremove", raw))
    );
    assert_eq!(processor.call_count(), 0);
    assert!(matches!(
        cleaned.attempts[0].outcome,
        AttemptOutcome::Failed { stage: Stage::Resolving, .. }
    ));
    assert_eq!(harness.service.stats().transform_convention, 1);
}

#[tokio::test]
async fn test_unknown_host_without_processor_passes_through() {
    let config = PipelineConfig {
        transform_provider_pattern: Some(r"^https://ik\.imagekit\.io/".into()),
        transform_suffix: "?tr=e-bgremove".into(),
        ..pipeline()
    };
    let harness = Harness::new(config, None).await;

    let raw = "https://cdn.example.org/member-3.jpg";
    let cleaned = harness.service.submit_raw_photo("member-3", raw).await.unwrap();
    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::Passthrough));
    assert_eq!(cleaned.record.clean_reference.as_deref(), Some(raw));
    assert!(!cleaned.record.is_fully_cleaned());
}

#[tokio::test]
async fn test_slow_host_skips_to_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(encode(portrait(50, 50), ImageFormat::Png))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let config = PipelineConfig {
        timeout_ms: 200,
        ..pipeline()
    };
    let harness = Harness::healthy(config).await;

    let raw = format!("{}/slow.jpg", server.uri());
    let started = Instant::now();
    let cleaned = harness.service.submit_raw_photo("member-4", &raw).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::Passthrough));
    assert_eq!(cleaned.record.clean_reference.as_deref(), Some(raw.as_str()));
    assert!(matches!(
        cleaned.attempts[0].outcome,
        AttemptOutcome::Failed { stage: Stage::Resolving, .. }
    ));
    assert_eq!(harness.service.stats().resolution_failures, 1);
}

#[tokio::test]
async fn test_reclean_is_visually_idempotent() {
    let server = MockServer::start().await;
    host_photo(&server, "/photo.png", encode(portrait(640, 480), ImageFormat::Png)).await;

    let harness = Harness::healthy(pipeline()).await;
    let raw = format!("{}/photo.png", server.uri());
    let first = harness.service.submit_raw_photo("member-5", &raw).await.unwrap();
    let second = harness.service.reclean_photo("member-5").await.unwrap();

    let first_uri = first.record.clean_reference.unwrap();
    let second_uri = second.record.clean_reference.clone().unwrap();
    assert_ne!(first_uri, second_uri);
    assert_eq!(second.record.raw_reference.as_deref(), Some(raw.as_str()));

    let a = harness.fetch_image(&first_uri).await.into_rgba8();
    let b = harness.fetch_image(&second_uri).await.into_rgba8();
    assert_eq!(a.dimensions(), b.dimensions());
    assert_eq!(a.get_pixel(0, 0), b.get_pixel(0, 0));
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_wide_photo_is_bounded() {
    let server = MockServer::start().await;
    host_photo(&server, "/wide.png", encode(portrait(2000, 500), ImageFormat::Png)).await;

    let harness = Harness::healthy(pipeline()).await;
    let cleaned = harness
        .service
        .submit_raw_photo("member-6", &format!("{}/wide.png", server.uri()))
        .await
        .unwrap();

    let image = harness
        .fetch_image(cleaned.record.clean_reference.as_deref().unwrap())
        .await;
    assert_eq!((image.width(), image.height()), (800, 200));
}

#[tokio::test]
async fn test_uploaded_photo_then_reclean_from_local_store() {
    let harness = Harness::healthy(pipeline()).await;
    let upload = Bytes::from(encode(portrait(300, 400), ImageFormat::Jpeg));

    let cleaned = harness
        .service
        .submit_uploaded_photo("member-7", upload.clone(), Some("image/jpeg".into()))
        .await
        .unwrap();
    let raw = cleaned.record.raw_reference.clone().unwrap();
    assert!(raw.starts_with(&format!("{}/raw/member-7/sha256-", FILES)));
    assert!(raw.ends_with(".jpg"));
    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::LocalPipeline));

    // Same bytes stage to the same object
    let again = harness
        .service
        .submit_uploaded_photo("member-7", upload, None)
        .await
        .unwrap();
    assert_eq!(again.record.raw_reference.as_deref(), Some(raw.as_str()));

    // Nothing listens on localhost:8095; the raw URI must resolve from the store itself
    let recleaned = harness.service.reclean_photo("member-7").await.unwrap();
    assert_eq!(recleaned.record.produced_by, Some(ProducedBy::LocalPipeline));
    let image = harness
        .fetch_image(recleaned.record.clean_reference.as_deref().unwrap())
        .await;
    assert_eq!((image.width(), image.height()), (300, 400));
}

#[tokio::test]
async fn test_reclean_degraded_upgrades_passthrough_records() {
    let server = MockServer::start().await;
    host_photo(&server, "/a.png", encode(portrait(200, 200), ImageFormat::Png)).await;
    host_photo(&server, "/b.png", encode(portrait(200, 100), ImageFormat::Png)).await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalObjectStore::new(dir.path(), FILES).await.unwrap());
    let records = Arc::new(MemoryRecordStore::new());

    // Processing offline: both land on passthrough
    let offline = PhotoService::new(&pipeline(), records.clone(), store.clone(), None).unwrap();
    for (identity, file) in [("member-8", "a.png"), ("member-9", "b.png")] {
        let cleaned = offline
            .submit_raw_photo(identity, &format!("{}/{}", server.uri(), file))
            .await
            .unwrap();
        assert_eq!(cleaned.record.produced_by, Some(ProducedBy::Passthrough));
    }
    records.create("member-10").await.unwrap();

    let online = PhotoService::new(
        &pipeline(),
        records.clone(),
        store.clone(),
        Some(Arc::new(InProcessProcessor::default())),
    )
    .unwrap();
    let results = online.reclean_degraded().await.unwrap();

    // member-10 has no raw photo and is not a candidate
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.produced_by, Some(ProducedBy::LocalPipeline), "{:?}", result);
        assert!(result.error.is_none());
    }
    for identity in ["member-8", "member-9"] {
        let record = records.get(identity).await.unwrap().unwrap();
        assert!(record.is_fully_cleaned());
    }
    assert!(online.reclean_degraded().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_storage_failure_falls_back() {
    let host = MockServer::start().await;
    host_photo(&host, "/photo.png", encode(portrait(120, 160), ImageFormat::Png)).await;

    let bucket = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&bucket)
        .await;

    let storage = Arc::new(
        HttpObjectStore::new(
            format!("{}/bucket", bucket.uri()),
            "https://cdn.test",
            None,
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let service = PhotoService::new(
        &pipeline(),
        Arc::new(MemoryRecordStore::new()),
        storage,
        Some(Arc::new(InProcessProcessor::default())),
    )
    .unwrap();

    let raw = format!("{}/photo.png", host.uri());
    let cleaned = service.submit_raw_photo("member-11", &raw).await.unwrap();
    assert_eq!(cleaned.record.produced_by, Some(ProducedBy::Passthrough));
    assert_eq!(cleaned.record.clean_reference.as_deref(), Some(raw.as_str()));
    assert!(matches!(
        cleaned.attempts[0].outcome,
        AttemptOutcome::Failed { stage: Stage::Uploading, .. }
    ));

    let stats = service.stats();
    assert_eq!(stats.storage_failures, 1);
    assert_eq!(stats.passthrough, 1);
    assert_eq!(stats.local_pipeline, 0);
}
