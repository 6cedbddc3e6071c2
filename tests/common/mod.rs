//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{Request, header};
use eventsource_stream::Eventsource;
use futures_util::{StreamExt, stream};
use image::{DynamicImage, ImageFormat, RgbImage};

pub const BOUNDARY: &str = "valormm-test-boundary";

/// Hand-built `multipart/form-data` body.
#[derive(Default)]
pub struct Multipart {
    buf: Vec<u8>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.buf.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(bytes);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    pub fn into_request(mut self, uri: &str) -> Request<Body> {
        self.buf.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(self.buf))
            .unwrap()
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a complete `text/event-stream` body. Comment-only blocks are dropped.
pub async fn parse_sse(body: String) -> Vec<SseEvent> {
    stream::once(async move { Ok::<_, Infallible>(body) })
        .eventsource()
        .map(|event| {
            let event = event.unwrap();
            SseEvent { event: (event.event != "message").then_some(event.event), data: event.data }
        })
        .collect()
        .await
}

/// Concatenated payload of plain data events, excluding `[DONE]`.
pub fn sse_text(events: &[SseEvent]) -> String {
    events
        .iter()
        .filter(|e| e.event.is_none() && e.data != "[DONE]")
        .map(|e| e.data.as_str())
        .collect()
}
