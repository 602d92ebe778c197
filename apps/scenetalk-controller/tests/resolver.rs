use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use catalog_client::{AdvertiseAck, AssetRecord, Catalog, CatalogError, DownloadInfo, WorkerAdvertisement};
use futures_util::{stream, StreamExt};
use scenetalk_controller::protocol::{AdminReply, FileUpload, PackageRef, ResolveRequest};
use scenetalk_controller::resolver::{Downloader, Resolver};
use scenetalk_controller::work::{
    resolve_queue, response_queue, ResolveOutcome, ResolveQueue, ResponseQueueReceiver,
};
use serde_json::Map;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HDA_BYTES: &[u8] = b"hda-contents";
const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-a-png";
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Catalog double that records every call it receives.
struct StubCatalog {
    files: String,
    calls: Mutex<Vec<String>>,
}

impl StubCatalog {
    fn new(files: String) -> Self {
        Self {
            files,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn asset(name: &str, package_id: Option<&str>) -> AssetRecord {
    AssetRecord {
        asset_id: Some(format!("asset_{name}")),
        name: Some(name.to_string()),
        version: Some(serde_json::json!([1, 0])),
        package_id: package_id.map(str::to_string),
        ..Default::default()
    }
}

fn download(url: String, content_type: Option<&str>) -> DownloadInfo {
    DownloadInfo {
        url,
        content_type: content_type.map(str::to_string),
        name: None,
        size: None,
        extra: Map::new(),
    }
}

#[async_trait]
impl Catalog for StubCatalog {
    async fn get_asset(&self, asset_id: &str, version: &str) -> Result<AssetRecord, CatalogError> {
        self.record(format!("by_id:{asset_id}@{version}"));
        Ok(asset("by_id", Some("pkg_plain")))
    }

    async fn get_asset_by_name(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<AssetRecord>, CatalogError> {
        self.record(format!("by_name:{name}@{version}"));
        Ok(match name {
            "crystal_pack" => Some(asset(name, Some("pkg_plain"))),
            "zipped_pack" => Some(asset(name, Some("pkg_zip"))),
            "hollow_pack" => Some(asset(name, None)),
            _ => None,
        })
    }

    async fn get_download_info(&self, file_id: &str) -> Result<DownloadInfo, CatalogError> {
        self.record(format!("download_info:{file_id}"));
        let files = &self.files;
        Ok(match file_id {
            "pkg_plain" => download(format!("{files}/files/crystal_pack.hda?sig=abc"), None),
            "pkg_zip" => download(format!("{files}/files/archive"), Some("application/zip")),
            "file_png" => download(format!("{files}/files/image"), Some("image/png")),
            "file_broken" => download(format!("{files}/files/broken"), Some("image/png")),
            "file_stalled" => download(format!("{files}/files/stalled"), Some("model/x-hda")),
            _ => download(format!("{files}/files/image"), None),
        })
    }

    async fn advertise(&self, _: &WorkerAdvertisement) -> Result<AdvertiseAck, CatalogError> {
        Ok(AdvertiseAck::default())
    }
}

fn bundle_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("scene/main.hda", options).unwrap();
    writer.write_all(HDA_BYTES).unwrap();
    writer.start_file("README.txt", options).unwrap();
    writer.write_all(b"crystal pack").unwrap();
    writer.finish().unwrap().into_inner()
}

async fn spawn_file_server() -> String {
    let archive = bundle_zip();
    let router = Router::new()
        .route("/files/crystal_pack.hda", get(|| async { HDA_BYTES }))
        .route(
            "/files/archive",
            get(move || {
                let archive = archive.clone();
                async move {
                    (
                        [(header::CONTENT_DISPOSITION, r#"attachment; filename="bundle.zip""#)],
                        archive,
                    )
                        .into_response()
                }
            }),
        )
        .route("/files/image", get(|| async { PNG_BYTES }))
        .route(
            "/files/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "storage offline") }),
        )
        .route(
            "/files/stalled",
            get(|| async {
                // A few bytes, then nothing more.
                let body = stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"hda")) })
                    .chain(stream::pending());
                Body::from_stream(body)
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

struct Harness {
    catalog: Arc<StubCatalog>,
    cache: TempDir,
    jobs: ResolveQueue,
    replies: ResponseQueueReceiver,
    shutdown: CancellationToken,
    resolver: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let files = spawn_file_server().await;
        let catalog = Arc::new(StubCatalog::new(files));
        let cache = TempDir::new().unwrap();
        let (jobs, jobs_rx) = resolve_queue();
        let (responses, replies) = response_queue();
        let shutdown = CancellationToken::new();

        let resolver = Resolver::new(
            catalog.clone(),
            Downloader::new(Duration::from_secs(5), IDLE_TIMEOUT).unwrap(),
            cache.path().join("packages"),
            responses,
        );
        let token = shutdown.clone();
        let resolver = tokio::spawn(async move {
            resolver.run(jobs_rx, token).await.unwrap();
        });

        Self {
            catalog,
            cache,
            jobs,
            replies,
            shutdown,
            resolver,
        }
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache.path().join("packages")
    }

    async fn resolve(&self, request: ResolveRequest) -> ResolveOutcome {
        self.jobs.submit(request).unwrap().wait().await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), self.resolver)
            .await
            .expect("resolver should stop promptly")
            .unwrap();
    }
}

fn resolved(outcome: ResolveOutcome) -> PathBuf {
    match outcome {
        ResolveOutcome::Resolved(path) => path,
        other => panic!("expected a resolved path, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn resolve_for_cook_downloads_package_into_cache() {
    let harness = Harness::start().await;
    let package = PackageRef::by_name("crystal_pack", "1.0", Some("default".into()));

    let path = resolved(harness.resolve(ResolveRequest::ForCook(package)).await);

    assert_eq!(path, harness.cache_dir().join("crystal_pack.hda"));
    assert_eq!(std::fs::read(&path).unwrap(), HDA_BYTES);
    assert_eq!(
        harness.catalog.calls(),
        ["by_name:crystal_pack@1.0", "download_info:pkg_plain"]
    );
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn asset_id_lookup_never_queries_by_name() {
    let harness = Harness::start().await;
    let mut package = PackageRef::by_id("asset_77", "2.0");
    package.package_name = Some("crystal_pack".into());

    resolved(harness.resolve(ResolveRequest::ForCook(package)).await);

    let calls = harness.catalog.calls();
    assert_eq!(calls[0], "by_id:asset_77@2.0");
    assert!(calls.iter().all(|call| !call.starts_with("by_name")));
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn zip_packages_resolve_to_extracted_directory() {
    let harness = Harness::start().await;
    let package = PackageRef::by_name("zipped_pack", "1.0", None);

    let path = resolved(harness.resolve(ResolveRequest::ForCook(package)).await);

    assert_eq!(path, harness.cache_dir().join("bundle"));
    assert!(path.is_dir());
    assert_eq!(std::fs::read(path.join("scene/main.hda")).unwrap(), HDA_BYTES);
    assert_eq!(std::fs::read(path.join("README.txt")).unwrap(), b"crystal pack");
    assert!(harness.cache_dir().join("bundle.zip").is_file());
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn file_resolve_reports_upload_and_is_repeatable() {
    let mut harness = Harness::start().await;
    let request = ResolveRequest::File {
        file_id: "file_png".into(),
    };

    let first = resolved(harness.resolve(request.clone()).await);
    let first_bytes = std::fs::read(&first).unwrap();
    let second = resolved(harness.resolve(request).await);
    let second_bytes = std::fs::read(&second).unwrap();

    assert_eq!(first, harness.cache_dir().join("file_png.png"));
    assert_eq!(first_bytes, PNG_BYTES);
    assert_eq!(first_bytes, second_bytes);

    let expected = AdminReply::FileUpload {
        data: FileUpload {
            file_id: "file_png".into(),
            file_path: first.display().to_string(),
        },
    };
    let shutdown = harness.shutdown.clone();
    assert_eq!(harness.replies.next(&shutdown).await, Some(expected.clone()));
    assert_eq!(harness.replies.next(&shutdown).await, Some(expected));
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn failures_complete_the_request_and_keep_the_loop_alive() {
    let harness = Harness::start().await;

    let unknown = harness
        .resolve(ResolveRequest::ForCook(PackageRef::by_name("ghost_pack", "1.0", None)))
        .await;
    assert!(matches!(unknown, ResolveOutcome::Failed(reason) if reason.contains("ghost_pack")));

    let hollow = harness
        .resolve(ResolveRequest::ForCook(PackageRef::by_name("hollow_pack", "1.0", None)))
        .await;
    assert!(matches!(hollow, ResolveOutcome::Failed(reason) if reason.contains("package_id")));

    let untyped = harness
        .resolve(ResolveRequest::File {
            file_id: "file_untyped".into(),
        })
        .await;
    assert!(matches!(untyped, ResolveOutcome::Failed(reason) if reason.contains("content type")));

    let package = PackageRef::by_name("crystal_pack", "1.0", None);
    resolved(harness.resolve(ResolveRequest::ForCook(package)).await);
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn error_status_from_file_host_fails_the_request() {
    let mut harness = Harness::start().await;

    let outcome = harness
        .resolve(ResolveRequest::File {
            file_id: "file_broken".into(),
        })
        .await;
    assert!(
        matches!(&outcome, ResolveOutcome::Failed(reason) if reason.contains("500")),
        "got {outcome:?}"
    );
    assert!(!harness.cache_dir().join("file_broken.png").exists());

    // No upload is announced for the failed file.
    resolved(
        harness
            .resolve(ResolveRequest::File {
                file_id: "file_png".into(),
            })
            .await,
    );
    let shutdown = harness.shutdown.clone();
    match harness.replies.next(&shutdown).await {
        Some(AdminReply::FileUpload { data }) => assert_eq!(data.file_id, "file_png"),
        other => panic!("unexpected reply {other:?}"),
    }
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn stalled_download_times_out_and_leaves_no_partial_file() {
    let harness = Harness::start().await;

    let outcome = harness
        .resolve(ResolveRequest::File {
            file_id: "file_stalled".into(),
        })
        .await;
    assert!(
        matches!(&outcome, ResolveOutcome::Failed(reason) if reason.contains("stalled")),
        "got {outcome:?}"
    );
    let leftovers: Vec<_> = std::fs::read_dir(harness.cache_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "cache holds {leftovers:?}");

    // The resolver is still serving requests.
    let package = PackageRef::by_name("crystal_pack", "1.0", None);
    resolved(harness.resolve(ResolveRequest::ForCook(package)).await);
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_releases_an_idle_resolver() {
    let harness = Harness::start().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!harness.resolver.is_finished());
    harness.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn queued_work_is_abandoned_at_shutdown() {
    let (jobs, jobs_rx) = resolve_queue();
    let (responses, _replies) = response_queue();
    let shutdown = CancellationToken::new();
    let cache = TempDir::new().unwrap();
    let resolver = Resolver::new(
        Arc::new(StubCatalog::new("http://127.0.0.1:9".into())),
        Downloader::new(Duration::from_secs(1), IDLE_TIMEOUT).unwrap(),
        cache.path(),
        responses,
    );

    let waiter = jobs
        .submit(ResolveRequest::File {
            file_id: "file_png".into(),
        })
        .unwrap();
    shutdown.cancel();
    resolver.run(jobs_rx, shutdown).await.unwrap();
    assert_eq!(waiter.wait().await, ResolveOutcome::Abandoned);
    assert!(cache.path().read_dir().unwrap().next().is_none());
}
