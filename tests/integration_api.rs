use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;
use voiceviz::server::{build_router, AppState};
use voiceviz::session::SessionStore;
use voiceviz::settings::ServerSettings;

async fn spawn_mock(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn gemini_mock(reply: &'static str) -> Router {
    Router::new().fallback(move || async move {
        Json(json!({
            "candidates": [ { "content": { "parts": [ { "text": reply } ] } } ]
        }))
    })
}

/// Echoes the requested language code back as two transcript segments.
fn speech_mock() -> Router {
    Router::new().fallback(|Json(body): Json<Value>| async move {
        let lang = body["config"]["languageCode"].as_str().unwrap_or("?").to_string();
        Json(json!({
            "results": [
                { "alternatives": [ { "transcript": "show sales by region" } ] },
                { "alternatives": [ { "transcript": format!("lang {}", lang) } ] }
            ]
        }))
    })
}

fn app(dir: &Path, tweak: impl FnOnce(&mut ServerSettings)) -> Router {
    let mut settings = ServerSettings::default();
    settings.session_dir = Some(dir.to_path_buf());
    settings.http_timeout_secs = 5;
    tweak(&mut settings);
    build_router(Arc::new(AppState::from_settings(settings).unwrap()))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_reports_service() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |_| {});

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "voiceviz");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_settings_never_expose_keys() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.gemini_api_key = "secret-gemini".into();
    });

    let req = Request::builder().uri("/api/settings").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["geminiConfigured"], true);
    assert_eq!(body["speechConfigured"], false);
    assert!(!body.to_string().contains("secret-gemini"));
}

#[tokio::test]
async fn test_text_to_sql_strips_fences() {
    let gemini = spawn_mock(gemini_mock("```sql\nSELECT * FROM orders;\n```")).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.gemini_base_url = gemini;
        s.gemini_api_key = "test-key".into();
    });

    let (status, body) = send(
        &app,
        post_json("/api/text-to-sql", json!({ "text": "all orders", "databaseType": "postgresql" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sqlQuery"], "SELECT * FROM orders;");
}

#[tokio::test]
async fn test_text_to_sql_without_key_is_internal_error() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |_| {});

    let (status, body) = send(&app, post_json("/api/text-to-sql", json!({ "text": "all orders" }))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to convert text to SQL");
}

#[tokio::test]
async fn test_speech_base64_uses_default_language() {
    let speech = spawn_mock(speech_mock()).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.speech_base_url = speech;
        s.speech_api_key = "test-key".into();
    });

    // "hello" in base64, wrapped as a data URL.
    let (status, body) = send(
        &app,
        post_json(
            "/api/speech-to-text/base64",
            json!({ "audio": "data:audio/webm;base64,aGVsbG8=" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transcription"], "show sales by region\nlang en-US");
}

#[tokio::test]
async fn test_speech_multipart_upload() {
    let speech = spawn_mock(speech_mock()).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.speech_base_url = speech;
        s.speech_api_key = "test-key".into();
    });

    let boundary = "voicevizboundary";
    let form = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"clip.webm\"\r\n\
         Content-Type: audio/webm\r\n\r\nfake-audio-bytes\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"language\"\r\n\r\nde-DE\r\n\
         --{b}--\r\n",
        b = boundary
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/speech-to-text")
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(form))
        .unwrap();

    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transcription"], "show sales by region\nlang de-DE");
}

#[tokio::test]
async fn test_speech_permission_denied_maps_to_403() {
    let speech = spawn_mock(Router::new().fallback(|| async {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": { "code": 403, "status": "PERMISSION_DENIED" } })),
        )
    }))
    .await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.speech_base_url = speech;
        s.speech_api_key = "bad-key".into();
    });

    let (status, body) = send(&app, post_json("/api/speech-to-text/base64", json!({ "audio": "aGVsbG8=" }))).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Permission denied. Check your API credentials.");
}

#[tokio::test]
async fn test_query_check_consults_classifier() {
    let classifier = spawn_mock(Router::new().route(
        "/predict",
        post(|Json(body): Json<Value>| async move {
            let flagged = body["query"].as_str().unwrap_or("").contains("information_schema");
            Json(json!({ "isMalicious": flagged, "confidence": 0.9, "model": body["model"] }))
        }),
    ))
    .await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.classifier_url = Some(format!("{}/predict", classifier));
    });

    let (status, body) = send(
        &app,
        post_json("/api/query/check", json!({ "query": "SELECT * FROM information_schema.tables" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isMalicious"], true);
    assert_eq!(body["source"], "classifier");

    let (_, body) = send(&app, post_json("/api/query/check", json!({ "query": "SELECT 1" }))).await;
    assert_eq!(body["isMalicious"], false);
    assert_eq!(body["source"], "classifier");

    let (_, body) = send(
        &app,
        post_json("/api/query/check", json!({ "query": "SELECT * FROM t WHERE a = '' OR '1'='1'" })),
    )
    .await;
    assert_eq!(body["isMalicious"], true);
    assert_eq!(body["source"], "prefilter");
}

#[tokio::test]
async fn test_query_check_survives_classifier_outage() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.classifier_url = Some("http://127.0.0.1:1/predict".into());
    });

    let (status, body) = send(&app, post_json("/api/query/check", json!({ "query": "DELETE FROM carts" }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isMalicious"], false);
    assert_eq!(body["source"], "none");
    assert_eq!(body["requiresConfirmation"], true);
    assert_eq!(body["sensitiveKeywords"], json!(["DELETE"]));
}

#[tokio::test]
async fn test_session_result_and_overview() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let store = SessionStore::new(temp_dir.path());
    store
        .save_result(
            "tab-1",
            "SELECT region, total FROM sales",
            &json!([{ "region": "EU", "total": 12 }, { "region": "US", "total": 7 }]),
        )
        .await
        .unwrap();
    let app = app(temp_dir.path(), |_| {});

    let get = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("x-session-id", "tab-1")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&app, get("/api/session/result")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "SELECT region, total FROM sales");

    let (status, body) = send(&app, get("/api/session/overview")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalEntries"], 2);
    assert_eq!(body["columns"], json!(["region", "total"]));
    assert_eq!(body["columnTypes"]["total"], "number");
    assert_eq!(body["primaryKey"], "region");

    // Other sessions see nothing.
    let req = Request::builder().uri("/api/session/result").body(Body::empty()).unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/session")
        .header("x-session-id", "tab-1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, get("/api/session/result")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_cleans_markdown() {
    let gemini = spawn_mock(gemini_mock("**Sure.** Use a *bar chart*.")).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.gemini_base_url = gemini;
        s.gemini_api_key = "test-key".into();
    });

    let (status, body) = send(&app, post_json("/api/chat", json!({ "message": "which chart?" }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"], "Sure. Use a bar chart.");
}

#[tokio::test]
async fn test_charts_relay_archive() {
    let charts = spawn_mock(Router::new().fallback(|Json(body): Json<Value>| async move {
        let rows = body["data"].as_array().map_or(0, Vec::len);
        (
            [("content-type", "application/zip")],
            format!("PK-fake-archive-{}", rows),
        )
    }))
    .await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.chart_service_url = charts;
    });

    let resp = app
        .clone()
        .oneshot(post_json("/api/charts", json!({ "data": [{ "a": 1 }, { "a": 2 }] })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/zip");
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"PK-fake-archive-2");
}

#[tokio::test]
async fn test_charts_default_to_session_result() {
    let charts = spawn_mock(Router::new().fallback(|| async {
        ([("content-type", "application/zip")], "PK")
    }))
    .await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.chart_service_url = charts;
    });

    let req = Request::builder()
        .method("POST")
        .uri("/api/charts")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    SessionStore::new(temp_dir.path())
        .save_result("default", "SELECT 1", &json!([{ "x": 1 }]))
        .await
        .unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/api/charts")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

/// Stores a connection to a port nothing listens on, so generated SQL
/// reaches the driver and fails in-band.
async fn store_unreachable_connection(dir: &Path) {
    let params = serde_json::from_value(json!({
        "type": "postgresql",
        "host": "127.0.0.1",
        "port": 1,
        "database": "shop",
        "username": "app",
        "password": "pw"
    }))
    .unwrap();
    SessionStore::new(dir).save_connection("default", &params).await.unwrap();
}

#[tokio::test]
async fn test_ask_reports_driver_error_in_band() {
    let gemini = spawn_mock(gemini_mock("SELECT region, SUM(total) FROM orders GROUP BY region")).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    store_unreachable_connection(temp_dir.path()).await;
    let app = app(temp_dir.path(), |s| {
        s.gemini_base_url = gemini;
        s.gemini_api_key = "test-key".into();
    });

    let (status, body) = send(&app, post_json("/api/ask", json!({ "text": "sales per region" }))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sqlQuery"], "SELECT region, SUM(total) FROM orders GROUP BY region");
    assert_eq!(body["success"], false);
    assert!(!body["error"].as_str().unwrap_or("").is_empty());
    assert_eq!(body["guard"]["isMalicious"], false);
}

#[tokio::test]
async fn test_ask_requires_confirmation_for_generated_delete() {
    let gemini = spawn_mock(gemini_mock("DELETE FROM orders WHERE total = 0")).await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    store_unreachable_connection(temp_dir.path()).await;
    let app = app(temp_dir.path(), |s| {
        s.gemini_base_url = gemini;
        s.gemini_api_key = "test-key".into();
    });

    let (status, body) = send(&app, post_json("/api/ask", json!({ "text": "remove empty orders" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["requiresConfirmation"], true);
    assert_eq!(body["keywords"], json!(["DELETE"]));

    let (status, body) = send(
        &app,
        post_json("/api/ask", json!({ "text": "remove empty orders", "confirmed": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_ask_blocked_by_classifier() {
    let gemini = spawn_mock(gemini_mock("SELECT * FROM users")).await;
    let classifier = spawn_mock(Router::new().fallback(|| async {
        Json(json!({ "is_malicious": true, "confidence": 0.97 }))
    }))
    .await;
    let temp_dir = tempfile::TempDir::new().unwrap();
    store_unreachable_connection(temp_dir.path()).await;
    let app = app(temp_dir.path(), |s| {
        s.gemini_base_url = gemini;
        s.gemini_api_key = "test-key".into();
        s.classifier_url = Some(classifier);
    });

    let (status, body) = send(&app, post_json("/api/ask", json!({ "text": "every user" }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Potential SQL injection detected");
}

#[tokio::test]
async fn test_oversized_audio_is_413() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let app = app(temp_dir.path(), |s| {
        s.max_audio_bytes = 1000;
        s.speech_api_key = "test-key".into();
    });

    let boundary = "voicevizboundary";
    let upload = |size: usize| {
        let mut form = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"clip.webm\"\r\n\
             Content-Type: audio/webm\r\n\r\n",
            b = boundary
        )
        .into_bytes();
        form.extend(std::iter::repeat(b'a').take(size));
        form.extend(format!("\r\n--{}--\r\n", boundary).into_bytes());
        Request::builder()
            .method("POST")
            .uri("/api/speech-to-text")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(form))
            .unwrap()
    };

    // Over the audio limit but inside the body limit.
    let (status, body) = send(&app, upload(1500)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "Audio file is too large");

    // Over the body limit: rejected while streaming.
    let (status, body) = send(&app, upload(100 * 1024)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "Audio file is too large");

    let audio = "A".repeat(90 * 1024);
    let (status, body) = send(&app, post_json("/api/speech-to-text/base64", json!({ "audio": audio }))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "Audio file is too large");
}
