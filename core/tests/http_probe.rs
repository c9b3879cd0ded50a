use std::fs;
use std::sync::Arc;

use blockdl_core::net::{NetClient, ReqwestNetClient};
use blockdl_core::probe::{ProbeInput, ProbeOutcome, ResourceProbe};
use blockdl_core::volume::{FixedVolume, VolumeProbe};
use blockdl_core::{
    EngineConfig, ErrorCode, MissionContext, MissionRegistry, MissionRequest, MissionStatus,
};
use tempfile::TempDir;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn sized(status: u16, len: usize) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .insert_header("content-length", len.to_string().as_str())
        .set_body_bytes(payload(len))
}

async fn probe(url: String) -> Result<ProbeOutcome, ErrorCode> {
    tokio::task::spawn_blocking(move || {
        let config = EngineConfig::default();
        let net: Arc<dyn NetClient> = Arc::new(ReqwestNetClient::new(&config).unwrap());
        let volume: Arc<dyn VolumeProbe> = Arc::new(FixedVolume {
            writable: true,
            available: None,
        });
        let input = ProbeInput {
            url,
            cookie: String::new(),
            user_agent: config.user_agent.clone(),
            name: String::new(),
            location: std::env::temp_dir(),
        };
        ResourceProbe::new(net, volume, config).probe(&input)
    })
    .await
    .expect("probe task")
}

#[tokio::test]
async fn partial_content_with_disposition_name() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/download"))
        .and(header("range", "bytes=0-"))
        .respond_with(
            sized(206, 4096)
                .insert_header("content-disposition", "attachment; filename=\"report.pdf\""),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/download"))
        .respond_with(sized(200, 4096))
        .with_priority(2)
        .mount(&server)
        .await;

    let url = format!("{}/download", server.uri());
    let outcome = probe(url.clone()).await.expect("probe ok");
    assert_eq!(outcome.url, url);
    assert_eq!(outcome.redirect_url, None);
    assert_eq!(outcome.length, 4096);
    assert_eq!(outcome.name, "report.pdf");
    assert!(!outcome.fallback);
}

#[tokio::test]
async fn missing_resource_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = probe(format!("{}/gone.zip", server.uri())).await;
    assert_eq!(result, Err(ErrorCode::NotFound));
}

#[tokio::test]
async fn plain_ok_selects_single_stream() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/files/plain.bin"))
        .respond_with(sized(200, 1500))
        .mount(&server)
        .await;

    let outcome = probe(format!("{}/files/plain.bin", server.uri()))
        .await
        .expect("probe ok");
    assert!(outcome.fallback);
    assert_eq!(outcome.length, 1500);
    assert_eq!(outcome.name, "plain.bin");
}

#[tokio::test]
async fn relative_redirect_is_resolved() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/mirror/disk.iso"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/mirror/disk.iso"))
        .and(header_exists("range"))
        .respond_with(sized(206, 2048))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/mirror/disk.iso"))
        .respond_with(sized(200, 2048))
        .with_priority(2)
        .mount(&server)
        .await;

    let outcome = probe(format!("{}/old", server.uri()))
        .await
        .expect("probe ok");
    let mirror = format!("{}/mirror/disk.iso", server.uri());
    assert_eq!(outcome.url, mirror);
    assert_eq!(outcome.redirect_url, Some(mirror));
    assert_eq!(outcome.name, "disk.iso");
    assert!(!outcome.fallback);
}

#[tokio::test]
async fn ranged_download_over_http() {
    let body = payload(2500);
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/blob.dat"))
        .and(header_exists("range"))
        .respond_with(sized(206, body.len()))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/blob.dat"))
        .respond_with(sized(200, body.len()))
        .with_priority(2)
        .mount(&server)
        .await;
    for (start, end) in [(0usize, 999usize), (1000, 1999), (2000, 2499)] {
        Mock::given(method("GET"))
            .and(path("/blob.dat"))
            .and(header("range", format!("bytes={}-{}", start, end).as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[start..=end].to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let url = format!("{}/blob.dat", server.uri());
    let temp = TempDir::new().unwrap();
    let downloads = temp.path().join("downloads");
    let tasks = temp.path().join("tasks");
    let (status, written, snapshots) = tokio::task::spawn_blocking(move || {
        let mut config = EngineConfig::default()
            .with_download_dir(&downloads)
            .with_task_dir(&tasks);
        config.block_size = 1000;
        let registry = MissionRegistry::open(MissionContext::new(config).unwrap()).unwrap();
        let id = registry
            .create(MissionRequest::new(url).with_workers(2))
            .unwrap();
        registry.wait_idle();

        let mission = registry.get(id).unwrap();
        let written = fs::read(mission.destination()).unwrap();
        let snapshots = fs::read_dir(&tasks)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .count();
        (mission.status(), written, snapshots)
    })
    .await
    .expect("download task");

    assert_eq!(status, MissionStatus::Finished);
    assert_eq!(written, body);
    assert_eq!(snapshots, 1);
}
