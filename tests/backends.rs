//! HTTP backends against a local mock server.
//!
//! Each backend is pointed at a wiremock instance through `base_url`, with
//! credentials supplied by an in-memory environment so the process
//! environment never leaks in.

use docvision::{
    BackendError, DescribeOptions, EnvSource, ModelConfig, ModelRegistry, RetryPolicy,
    RetryStrategy, VisionError, VisionModel,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// `RUST_LOG=docvision=debug cargo test --test backends -- --nocapture`
/// shows each attempt and backoff.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_strategy(RetryStrategy::Exponential)
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
}

fn png_fixture() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.png");
    image::RgbImage::from_pixel(8, 6, image::Rgb([255, 255, 255]))
        .save(&path)
        .unwrap();
    (dir, path)
}

fn backend(name: &str, server: &MockServer) -> Arc<dyn VisionModel> {
    init_tracing();
    let env = EnvSource::from_pairs([
        ("OPENAI_API_KEY", "sk-test"),
        ("ANTHROPIC_API_KEY", "sk-ant-test"),
    ]);
    let config = ModelConfig::builder()
        .env(env)
        .base_url(server.uri())
        .timeout_secs(5)
        .retry(fast_retry())
        .build()
        .unwrap();
    ModelRegistry::with_builtin().create(name, &config).unwrap()
}

async fn describe(model: &dyn VisionModel, image: &Path) -> Result<String, VisionError> {
    model
        .describe_image(image, Some("What is on this page?"), &DescribeOptions::default())
        .await
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
}

fn openai_reply(text: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": text } }]
    })
}

fn claude_reply(text: &str) -> Value {
    json!({
        "id": "msg_1",
        "type": "message",
        "content": [{ "type": "text", "text": text }]
    })
}

fn ollama_reply(text: &str) -> Value {
    json!({ "model": "llama3.2-vision", "response": text, "done": true })
}

// ── OpenAI ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn openai_sends_prompt_and_data_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({ "model": "gpt-4o-mini", "max_tokens": 300 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("A blank white page.")))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let model = backend("openai", &server);
    let text = describe(model.as_ref(), &image).await.unwrap();
    assert_eq!(text, "A blank white page.");

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    let content = &body["messages"][0]["content"];
    assert_eq!(content[0]["text"], "What is on this page?");
    let url = content[1]["image_url"]["url"].as_str().unwrap();
    assert!(url.starts_with("data:image/png;base64,"), "{url}");
}

#[tokio::test]
async fn openai_rate_limit_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "120")
                .set_body_json(json!({
                    "error": { "message": "Rate limit reached", "type": "requests" }
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("ok")))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let model = backend("openai", &server);
    let start = Instant::now();
    let (text, attempts) = model
        .describe_image_counted(&image, None, &DescribeOptions::default())
        .await
        .unwrap();

    assert_eq!(text, "ok");
    assert_eq!(attempts, 2);
    // A server-suggested wait never exceeds the configured ceiling.
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn oversized_retry_after_is_clamped_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1e20"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("after the wait")))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let model = backend("openai", &server);
    let start = Instant::now();
    let (text, attempts) = assert_ok!(
        model
            .describe_image_counted(&image, None, &DescribeOptions::default())
            .await
    );

    assert_eq!(text, "after the wait");
    assert_eq!(attempts, 2);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn openai_bad_key_fails_after_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("openai", &server).as_ref(), &image)
        .await
        .unwrap_err();

    match &err {
        VisionError::Backend(BackendError::Authentication { message, .. }) => {
            assert!(message.contains("Incorrect API key"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.attempts(), 1);
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn openai_quota_is_fatal_even_on_429() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "You exceeded your current quota", "code": "insufficient_quota" }
        })))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("openai", &server).as_ref(), &image)
        .await
        .unwrap_err();
    assert!(
        matches!(err, VisionError::Backend(BackendError::QuotaExhausted { .. })),
        "{err:?}"
    );
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn openai_persistent_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("openai", &server).as_ref(), &image)
        .await
        .unwrap_err();
    match err {
        VisionError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, BackendError::ServerError { status: 503, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn openai_empty_reply_is_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("   ")))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("openai", &server).as_ref(), &image)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            VisionError::RetriesExhausted {
                last: BackendError::EmptyResponse { .. },
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(request_count(&server).await, 3);
}

// ── Claude ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn claude_sends_base64_image_block() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_reply("A white rectangle.")))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let text = describe(backend("anthropic", &server).as_ref(), &image)
        .await
        .unwrap();
    assert_eq!(text, "A white rectangle.");

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    let content = &body["messages"][0]["content"];
    assert_eq!(content[0]["type"], "image");
    assert_eq!(content[0]["source"]["type"], "base64");
    assert_eq!(content[0]["source"]["media_type"], "image/png");
    assert_eq!(content[1]["text"], "What is on this page?");
    assert_eq!(body["max_tokens"], 1024);
}

#[tokio::test]
async fn claude_overload_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_reply("third time lucky")))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let (text, attempts) = backend("claude", &server)
        .describe_image_counted(&image, None, &DescribeOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "third time lucky");
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn claude_invalid_request_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "type": "error",
            "error": { "type": "invalid_request_error", "message": "image exceeds 5 MB maximum" }
        })))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("claude", &server).as_ref(), &image)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            VisionError::Backend(BackendError::InvalidRequest { status: 400, .. })
        ),
        "{err:?}"
    );
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn claude_joins_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "First half. " },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "Second half." }
            ]
        })))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let text = assert_ok!(describe(backend("claude", &server).as_ref(), &image).await);
    assert_eq!(text, "First half. Second half.");
}

// ── Ollama ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ollama_generate_without_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "model": "llama3.2-vision", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ollama_reply("A small white image.")))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let model = backend("ollama", &server);
    let options = DescribeOptions {
        max_tokens: Some(64),
        ..Default::default()
    };
    let text = model
        .describe_image(&image, Some("Describe briefly"), &options)
        .await
        .unwrap();
    assert_eq!(text, "A small white image.");

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    assert_eq!(body["prompt"], "Describe briefly");
    assert_eq!(body["images"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["options"]["num_predict"], 64);
}

#[tokio::test]
async fn ollama_missing_model_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({ "error": "model 'llama3.2-vision' not found" })),
        )
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let err = describe(backend("llama", &server).as_ref(), &image)
        .await
        .unwrap_err();
    match err {
        VisionError::Backend(BackendError::InvalidRequest { status, message, .. }) => {
            assert_eq!(status, 404);
            assert!(message.contains("ollama pull"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn ollama_malformed_body_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ollama_reply("recovered")))
        .mount(&server)
        .await;

    let (_dir, image) = png_fixture();
    let text = assert_ok!(describe(backend("ollama", &server).as_ref(), &image).await);
    assert_eq!(text, "recovered");
    assert_eq!(request_count(&server).await, 2);
}

// ── Inputs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unreadable_inputs_fail_before_any_request() {
    let server = MockServer::start().await;
    let model = backend("openai", &server);

    let err = assert_err!(describe(model.as_ref(), Path::new("/definitely/missing.png")).await);
    assert!(matches!(err, VisionError::FileNotFound { .. }), "{err:?}");

    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("notes.png");
    std::fs::write(&bogus, "plain text, not pixels").unwrap();
    let err = assert_err!(describe(model.as_ref(), &bogus).await);
    assert!(matches!(err, VisionError::InvalidImage { .. }), "{err:?}");

    assert_eq!(request_count(&server).await, 0);
}
