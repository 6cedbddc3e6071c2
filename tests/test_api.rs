//! HTTP surface against the in-process echo backend.

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

use common::{Multipart, parse_sse, png, sse_text};
use valormm::chat::{ChatResponse, ChatService};
use valormm::comms::http::{HttpState, build_router};
use valormm::config::Config;

fn router() -> Router {
    let mut config = Config::test_default();
    config.pdf.renderer = "/nonexistent/pdftoppm".into();
    let chat = ChatService::from_config(&config).unwrap();
    build_router(HttpState::new(chat, config.defaults.clone()), &config.server)
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let resp = router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(v, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn test_chat_text_only() {
    let req = Multipart::new().text("message", "hello there").into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: ChatResponse = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body.answer, "[echo] hello there");
    assert!(body.usage.prompt_tokens > 0);
    assert_eq!(body.usage.completion_tokens, 3);
}

#[tokio::test]
async fn test_chat_usage_field_names() {
    let req = Multipart::new().text("message", "x").into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    let usage = v["usage"].as_object().unwrap();
    for key in ["prompt_tokens", "completion_tokens", "latency_ms"] {
        assert!(usage.contains_key(key), "missing usage.{key}");
    }
}

#[tokio::test]
async fn test_chat_resizes_uploaded_image() {
    let req = Multipart::new()
        .text("message", "describe")
        .text("max_image_edge", "1024")
        .file("files", "wide.png", "image/png", &png(2048, 1024))
        .into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: ChatResponse = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body.answer, "[echo] describe [image 1: 1024x512]");
}

#[tokio::test]
async fn test_chat_skips_undecodable_image() {
    let req = Multipart::new()
        .text("message", "x")
        .file("files", "broken.jpg", "image/jpeg", b"not really a jpeg")
        .file("files", "ok.png", "image/png", &png(10, 20))
        .into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: ChatResponse = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body.answer, "[echo] x [image 1: 10x20]");
}

#[tokio::test]
async fn test_chat_bad_bool_is_422() {
    let req = Multipart::new()
        .text("message", "x")
        .text("quant_4bit", "sometimes")
        .into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert!(v["error"].as_str().unwrap().contains("quant_4bit"));
}

#[tokio::test]
async fn test_chat_bad_int_is_422() {
    let req = Multipart::new().text("max_new_tokens", "lots").into_request("/api/v1/chat/stream");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_chat_pdf_failure_is_500() {
    let req = Multipart::new()
        .text("message", "summarize")
        .file("files", "doc.pdf", "application/pdf", b"%PDF-1.4 not much")
        .into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert!(v["error"].as_str().unwrap().contains("pdf"));
}

#[tokio::test]
async fn test_stream_strips_prompt_echo() {
    let history = r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello!"}]"#;
    let req = Multipart::new()
        .text("message", "next question")
        .text("history", history)
        .into_request("/api/v1/chat/stream");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap().to_string();
    assert!(ct.starts_with("text/event-stream"));

    let events = parse_sse(body_string(resp).await).await;
    assert_eq!(events.last().unwrap().data, "[DONE]");
    assert!(events.iter().all(|e| e.event.is_none()));
    assert_eq!(sse_text(&events), "[echo] next question");
}

#[tokio::test]
async fn test_stream_keeps_chunk_spacing() {
    let req = Multipart::new()
        .text("message", "a  b")
        .text("max_new_tokens", "10")
        .into_request("/api/v1/chat/stream");
    let resp = router().oneshot(req).await.unwrap();
    let events = parse_sse(body_string(resp).await).await;
    let chunks: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(chunks, vec!["[echo] ", "a ", " ", "b", "[DONE]"]);
}

#[tokio::test]
async fn test_stream_pdf_failure_is_500_json() {
    let req = Multipart::new()
        .file("files", "doc.PDF", "application/octet-stream", b"%PDF-1.4")
        .into_request("/api/v1/chat/stream");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert!(v.get("error").is_some());
}

#[tokio::test]
async fn test_invalid_history_is_ignored() {
    let req = Multipart::new()
        .text("message", "q")
        .text("history", "{not json")
        .into_request("/api/v1/chat");
    let resp = router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cors_preflight_for_frontend_origin() {
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/chat")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let resp = router().oneshot(req).await.unwrap();
    let headers = resp.headers();
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "http://localhost:3000");
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
}

#[tokio::test]
async fn test_cors_rejects_unknown_origin() {
    let req = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "http://evil.example")
        .body(Body::empty())
        .unwrap();
    let resp = router().oneshot(req).await.unwrap();
    assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
}

#[tokio::test]
async fn test_upload_over_limit_is_413() {
    let mut config = Config::test_default();
    config.server.max_upload_mb = 1;
    let chat = ChatService::from_config(&config).unwrap();
    let app = build_router(HttpState::new(chat, config.defaults.clone()), &config.server);

    let big = vec![0u8; 2 * 1024 * 1024];
    let req = Multipart::new()
        .text("message", "too big")
        .file("files", "blob.png", "image/png", &big)
        .into_request("/api/v1/chat");
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let v: Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert!(v.get("error").is_some());
}
