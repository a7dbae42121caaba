use std::sync::Arc;
use std::time::Duration;

use alpaca_runtime::{NoopTelemetry, ScriptProbe, ScriptedModel, TinyModel, TinyModelConfig};
use alpaca_server::{create_router, AppState, GenerationQueue, QueueConfig, QueueStats, ServerConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    queue: GenerationQueue,
}

fn app_with(model: Box<dyn alpaca_engine::ModelHandle>, capacity: usize, timeout: Duration) -> TestApp {
    let queue = GenerationQueue::start(
        model,
        QueueConfig {
            capacity,
            ..QueueConfig::default()
        },
        Arc::new(NoopTelemetry),
    )
    .unwrap();
    let state = AppState::new(
        queue.clone(),
        ServerConfig {
            request_timeout: timeout,
            ..ServerConfig::default()
        },
    );
    TestApp {
        router: create_router(state),
        queue,
    }
}

fn scripted_app(model: ScriptedModel) -> (TestApp, Arc<ScriptProbe>) {
    let probe = model.probe();
    (app_with(Box::new(model), 4, Duration::from_secs(5)), probe)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn send_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(router, get(uri)).await;
    let json = serde_json::from_str(&body).unwrap_or_else(|e| panic!("bad json {body:?}: {e}"));
    (status, json)
}

// -- /answer --

#[tokio::test]
async fn say_hello_returns_message() {
    let (app, probe) = scripted_app(ScriptedModel::default());
    let (status, json) = send_json(&app.router, "/answer?info=Say%20hello").await;

    assert_eq!(status, StatusCode::OK);
    let message = json["message"].as_str().unwrap();
    assert!(!message.is_empty());
    assert_eq!(message, "Hello! How can I help you today?");

    let prompts = probe.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("### Instruction:\n\nSay hello\n\n### Response:"));
}

#[tokio::test]
async fn tiny_model_answers() {
    let app = app_with(
        Box::new(TinyModel::random(TinyModelConfig::default(), 7)),
        4,
        Duration::from_secs(30),
    );
    let (status, json) = send_json(&app.router, "/answer?info=Say%20hello").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["message"].is_string());
    assert_eq!(app.queue.stats().completed, 1);
}

#[tokio::test]
async fn tiny_model_loaded_from_disk_answers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alpaca-tiny.safetensors");
    TinyModel::random(TinyModelConfig::default(), 11)
        .save(&path)
        .unwrap();

    let model = alpaca_runtime::load_model(alpaca_runtime::Backend::Tiny, &path).unwrap();
    let app = app_with(model, 4, Duration::from_secs(30));
    let (status, _) = send_json(&app.router, "/answer?info=hi").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn empty_info_is_rejected_before_queueing() {
    let (app, probe) = scripted_app(ScriptedModel::default());

    for uri in ["/answer?info=", "/answer", "/answer?info=%20%20", "/answer?other=1"] {
        let (status, json) = send_json(&app.router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json, serde_json::json!({"message": "invalid request"}));
    }

    assert_eq!(probe.calls(), 0);
    assert_eq!(
        app.queue.stats(),
        QueueStats {
            capacity: 4,
            ..QueueStats::default()
        }
    );
}

#[tokio::test]
async fn full_queue_returns_503() {
    let model = ScriptedModel::new("one two three four five six")
        .with_token_delay(Duration::from_millis(100));
    let app = app_with(Box::new(model), 1, Duration::from_secs(10));

    let router = app.router.clone();
    let first = tokio::spawn(async move { send(&router, get("/answer?info=first")).await });

    for _ in 0..200 {
        if app.queue.stats().active == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(app.queue.stats().active, 1);

    let (status, json) = send_json(&app.router, "/answer?info=second").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["message"], "busy");
    assert_eq!(app.queue.stats().rejected, 1);

    let (status, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn slow_generation_times_out() {
    let model = ScriptedModel::new("a b c d e f g h").with_token_delay(Duration::from_millis(100));
    let app = app_with(Box::new(model), 4, Duration::from_millis(150));

    let (status, json) = send_json(&app.router, "/answer?info=slow").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json["message"], "timeout");

    // The timed-out session is cancelled and its slot released.
    for _ in 0..200 {
        if app.queue.stats().cancelled == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = app.queue.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.active + stats.queued, 0);
}

#[tokio::test]
async fn generation_failure_returns_500() {
    let (app, _) = scripted_app(ScriptedModel::new("a b c").fail_after(1));
    let (status, json) = send_json(&app.router, "/answer?info=boom").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json, serde_json::json!({"message": "error"}));
    assert_eq!(app.queue.stats().failed, 1);
}

#[tokio::test]
async fn context_overflow_returns_500() {
    let model = TinyModel::random(
        TinyModelConfig {
            max_context: 64,
            ..TinyModelConfig::default()
        },
        5,
    );
    let app = app_with(Box::new(model), 4, Duration::from_secs(5));
    let (status, json) = send_json(&app.router, "/answer?info=hello").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["message"], "error");
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let (app, _) = scripted_app(ScriptedModel::default());
    let req = Request::builder()
        .uri("/answer?info=hi")
        .header("origin", "http://example.com")
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}

// -- /answer/stream --

#[tokio::test]
async fn stream_relays_tokens_then_done() {
    let (app, _) = scripted_app(ScriptedModel::new("alpha beta gamma"));
    let resp = app
        .router
        .clone()
        .oneshot(get("/answer/stream?info=Say%20hello"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.contains("text/event-stream"), "got {content_type}");

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(body.to_vec()).unwrap();

    let tokens: Vec<&str> = body
        .split("\n\n")
        .filter(|frame| frame.contains("event: token"))
        .filter_map(|frame| frame.lines().find_map(|l| l.strip_prefix("data: ")))
        .collect();
    assert_eq!(tokens, vec!["alpha", " beta", " gamma"]);
    assert!(body.contains("event: done\ndata: alpha beta gamma"));
    assert!(!body.contains("event: error"));
}

#[tokio::test]
async fn stream_rejects_empty_info_as_json() {
    let (app, probe) = scripted_app(ScriptedModel::default());
    let (status, json) = send_json(&app.router, "/answer/stream?info=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "invalid request");
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn stream_reports_generation_error() {
    let (app, _) = scripted_app(ScriptedModel::new("a b c").fail_after(2));
    let (status, body) = send(&app.router, get("/answer/stream?info=x")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: token"));
    assert!(body.contains("event: error\ndata: error"));
    assert!(!body.contains("event: done"));
}

#[tokio::test]
async fn stream_deadline_ends_with_timeout_event() {
    let model = ScriptedModel::new("a b c d e f g h").with_token_delay(Duration::from_millis(100));
    let app = app_with(Box::new(model), 4, Duration::from_millis(250));

    let (status, body) = send(&app.router, get("/answer/stream?info=slow")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: error\ndata: timeout"), "{body}");
    assert!(!body.contains("event: done"));

    for _ in 0..200 {
        if app.queue.stats().cancelled == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(app.queue.stats().cancelled, 1);
}

// -- /health --

#[tokio::test]
async fn health_reports_model_and_queue() {
    let (app, _) = scripted_app(ScriptedModel::default().with_name("alpaca-test"));
    send_json(&app.router, "/answer?info=warm%20up").await;

    let (status, json) = send_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "alpaca-test");
    assert_eq!(json["queue"]["capacity"], 4);
    assert_eq!(json["queue"]["completed"], 1);
    assert_eq!(json["queue"]["peak_active"], 1);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (app, _) = scripted_app(ScriptedModel::default());
    let (status, _) = send(&app.router, get("/v1/chat/completions")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
