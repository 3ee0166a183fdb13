#![cfg(unix)]

mod common;

use axum::{
    body::{Body, to_bytes},
    http::{
        Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    },
    response::Response,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use common::{TestApp, spawn_app, spawn_app_with_public_dir};

async fn get(app: &TestApp, uri: &str) -> Response {
    app.router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(app: &TestApp, uri: &str, body: &str) -> Response {
    app.router
        .clone()
        .oneshot(
            Request::post(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = spawn_app();

    let response = get(&app, "/api/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({ "ok": true }));
}

#[tokio::test]
async fn analyze_returns_normalized_formats() {
    let app = spawn_app();

    let response = post_json(&app, "/api/analyze", r#"{"url":"https://example.com/watch/v"}"#).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["title"], "Two videos");
    assert_eq!(body["thumbnail"], "http://127.0.0.1:9/unreachable.jpg");
    assert_eq!(body["extractor"], "generic");
    assert_eq!(body["webpage_url"], "https://example.com/watch/v");

    let formats = body["formats"].as_array().unwrap();
    assert_eq!(formats.len(), 2);
    assert_eq!(formats[0]["format_id"], "22");
    assert_eq!(formats[0]["isVideo"], true);
    assert_eq!(formats[1]["height"], 1080);
    assert_eq!(formats[1]["acodec"], "none");
    assert_eq!(formats[1]["filesize"], 5_242_880);
}

#[tokio::test]
async fn analyze_without_url_is_a_json_400() {
    let app = spawn_app();

    for body in [r#"{}"#, r#"{"url": 5}"#, "not json"] {
        let response = post_json(&app, "/api/analyze", body).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body:?}");
        assert_eq!(body_json(response).await["error"], "url is required");
    }
}

#[tokio::test]
async fn download_validation_errors_are_plain_text() {
    let app = spawn_app();

    let cases = [
        ("/api/download?preset=720p", "url is required"),
        (
            "/api/download?url=https%3A%2F%2Fexample.com%2Fv&preset=abcp",
            "invalid preset",
        ),
        (
            "/api/download?url=https%3A%2F%2Fexample.com%2Fv",
            "formatId is required (or use mode=mp3)",
        ),
    ];

    for (uri, expected) in cases {
        let response = get(&app, uri).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert!(
            response.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        assert_eq!(body_text(response).await, expected);
    }
    assert!(app.job_files().is_empty());
}

#[tokio::test]
async fn preset_download_streams_named_file_and_cleans_up() {
    let app = spawn_app();

    let response = get(
        &app,
        "/api/download?url=https%3A%2F%2Fexample.com%2Fv&preset=720p&title=My%20Clip",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers()[CONTENT_LENGTH], "200000");
    let disposition = response.headers()[CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("My Clip.mp4"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    assert_eq!(body.len(), 200_000);
    assert!(app.settled_job_files().await.is_empty());
}

#[tokio::test]
async fn mp3_mode_pipes_extractor_output() {
    let app = spawn_app();

    let response = get(&app, "/api/download?url=https%3A%2F%2Fexample.com%2Fv&mode=mp3").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "audio/mpeg");
    assert!(
        response.headers()[CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("download.mp3")
    );
    assert_eq!(body_text(response).await, "piped-audio");
}

#[tokio::test]
async fn thumbnail_requires_url_or_src() {
    let app = spawn_app();

    for uri in ["/api/thumbnail", "/api/thumbnail-view?title=x"] {
        let response = get(&app, uri).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "url is required");
    }
}

#[tokio::test]
async fn thumbnail_view_falls_back_to_extractor_image() {
    let app = spawn_app();

    let response = get(
        &app,
        "/api/thumbnail-view?url=https%3A%2F%2Fexample.com%2Fwatch%2Fv",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/jpeg");
    assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
    assert_eq!(body_text(response).await, "jpeg-bytes");
    assert!(app.settled_job_files().await.is_empty());
}

#[tokio::test]
async fn thumbnail_download_is_named_after_title() {
    let app = spawn_app();

    let response = get(
        &app,
        "/api/thumbnail?url=https%3A%2F%2Fexample.com%2Fwatch%2Fv&title=Cover%3A%20Art",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("Cover_ Art.jpg")
    );
}

#[tokio::test]
async fn missing_installer_redirects_to_front_end() {
    let app = spawn_app();

    let response = get(&app, "/download/windows").await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], "/?installer=missing");
}

#[tokio::test]
async fn front_end_is_served_with_index_fallback() {
    let public = TempDir::new().unwrap();
    std::fs::write(public.path().join("index.html"), "<h1>app</h1>").unwrap();
    std::fs::write(public.path().join("app.js"), "console.log(1)").unwrap();
    let app = spawn_app_with_public_dir(Some(public.path()));

    let asset = get(&app, "/app.js").await;
    assert_eq!(asset.status(), StatusCode::OK);
    assert_eq!(body_text(asset).await, "console.log(1)");

    let client_route = get(&app, "/some/client/route").await;
    assert_eq!(body_text(client_route).await, "<h1>app</h1>");

    let health = get(&app, "/api/health").await;
    assert_eq!(health.status(), StatusCode::OK);
}
