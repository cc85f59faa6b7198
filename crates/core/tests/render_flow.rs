use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tempfile::tempdir;
use tower::{Service, ServiceExt};

use textreel_core::config::AppConfig;
use textreel_core::encoder::{overlay_text, EncodeFailure, EncodeJob, Encoder};
use textreel_core::server::{app_router, app_state_with_config, AppState};
use textreel_core::service::RenderService;
use textreel_core::worker::WorkerSettings;

/// Records the order and overlay text of every job it is asked to encode.
#[derive(Default)]
struct RecordingEncoder {
    seen: Mutex<Vec<(String, String)>>,
}

impl Encoder for RecordingEncoder {
    fn encode(&self, job: &EncodeJob) -> Result<(), EncodeFailure> {
        self.seen
            .lock()
            .unwrap()
            .push((job.job_id.clone(), overlay_text(&job.scenes)));
        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(&job.paths.output, b"video")?;
        Ok(())
    }
}

async fn send(router: &mut Router, request: Request<Body>) -> Response {
    router
        .as_service()
        .ready()
        .await
        .unwrap()
        .call(request)
        .await
        .unwrap()
}

async fn json_body(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn submit(id: &str, texts: &[&str]) -> Request<Body> {
    let scenes: Vec<_> = texts
        .iter()
        .map(|text| serde_json::json!({ "onscreenText": text }))
        .collect();
    let body = serde_json::json!({ "id": id, "scenes": scenes });
    Request::builder()
        .method("POST")
        .uri("/render")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_terminal(router: &mut Router, id: &str) -> serde_json::Value {
    for _ in 0..250 {
        let resp = send(router, get(&format!("/status/{id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        if json["status"] == "DONE" || json["status"] == "ERROR" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} did not finish in time");
}

#[tokio::test]
async fn jobs_render_in_submission_order() {
    let dir = tempdir().expect("tempdir");
    let encoder = Arc::new(RecordingEncoder::default());
    let service = RenderService::start(
        encoder.clone(),
        WorkerSettings {
            work_dir: dir.path().join("renders"),
            diagnostic_tail_chars: 2000,
            max_finished_jobs: 100,
        },
    );
    let mut app = app_router(AppState::new(service.clone(), 1024 * 1024));

    for id in ["a", "b", "c"] {
        let resp = send(&mut app, submit(id, &["Hello", id])).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    for id in ["a", "b", "c"] {
        let json = wait_terminal(&mut app, id).await;
        assert_eq!(json["status"], "DONE", "job {id}: {json}");
    }

    let seen = encoder.seen.lock().unwrap().clone();
    let order: Vec<_> = seen.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(order, ["a", "b", "c"]);
    assert_eq!(seen[1].1, "Scene 1: Hello\nScene 2: b");

    service.shutdown().await;
}

#[tokio::test]
async fn unknown_and_unfinished_jobs_are_reported() {
    let dir = tempdir().expect("tempdir");
    let service = RenderService::start(
        Arc::new(RecordingEncoder::default()),
        WorkerSettings {
            work_dir: dir.path().join("renders"),
            diagnostic_tail_chars: 2000,
            max_finished_jobs: 100,
        },
    );
    let mut app = app_router(AppState::new(service.clone(), 1024 * 1024));

    let resp = send(&mut app, get("/status/missing")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp).await["error"], "Job not found");

    let resp = send(&mut app, get("/download/missing")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    service.shutdown().await;
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path.to_string_lossy().into_owned()
}

#[cfg(unix)]
#[tokio::test]
async fn configured_encoder_produces_downloadable_artifact() {
    let dir = tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "fake-ffmpeg.sh",
        "#!/bin/sh\nfor last; do :; done\necho 'frame=1 fps=0.0' >&2\nprintf 'fake-mp4' > \"$last\"\n",
    );

    let config_file = dir.path().join("config.toml");
    std::fs::write(
        &config_file,
        format!("[render]\nencoder_binary = \"{script}\"\n\n[paths]\nwork_dir = \"out\"\n"),
    )
    .expect("write config");
    let config = AppConfig::load_from_path(&config_file).expect("load config");

    let state = app_state_with_config(&config, dir.path());
    let service = state.service().clone();
    let mut app = app_router(state);

    let resp = send(&mut app, submit("reel-1", &["Hello", "World"])).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let json = wait_terminal(&mut app, "reel-1").await;
    assert_eq!(json["status"], "DONE", "{json}");
    let artifact = json["artifactPath"].as_str().expect("artifact path");
    assert!(Path::new(artifact).starts_with(dir.path().join("out")));

    let resp = send(&mut app, get("/download/reel-1")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"fake-mp4");

    service.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn failing_encoder_records_trailing_diagnostics() {
    let dir = tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "broken-ffmpeg.sh",
        "#!/bin/sh\ni=0\nwhile [ $i -lt 200 ]; do echo \"padding line $i\" >&2; i=$((i+1)); done\necho 'Error: codec not found' >&2\nexit 1\n",
    );

    let mut config = AppConfig::default();
    config.render.encoder_binary = script;
    config.render.diagnostic_tail_chars = 120;

    let state = app_state_with_config(&config, dir.path());
    let service = state.service().clone();
    let mut app = app_router(state);

    let resp = send(&mut app, submit("bad-reel", &["Hello"])).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let json = wait_terminal(&mut app, "bad-reel").await;
    assert_eq!(json["status"], "ERROR");
    let error = json["error"].as_str().expect("error text");
    assert!(error.chars().count() <= 120);
    assert!(error.ends_with("Error: codec not found"));
    assert!(json["artifactPath"].is_null());

    let resp = send(&mut app, get("/download/bad-reel")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    service.shutdown().await;
}
