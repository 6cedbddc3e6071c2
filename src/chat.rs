//! Request pipeline shared by the blocking and streaming chat endpoints.
//!
//! Uploads are split into images and PDFs, PDF pages are rendered and appended
//! after the uploaded images, everything is resized to the variant's long-edge
//! bound, and the prompt is handed to the cached model for that variant.

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::media::{self, MediaError, PdfRenderer, Upload};
use crate::vlm::cache::ModelCache;
use crate::vlm::scrub::{ASSISTANT_MARKER, MarkerScrubber};
use crate::vlm::template::{ChatTurn, build_messages, render_echo};
use crate::vlm::{ChunkReceiver, GenerationRequest, LoadedModel, VariantKey, VlmBackend, VlmError, providers};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Vlm(#[from] VlmError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("worker task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub usage: Usage,
}

/// A parsed chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub variant: VariantKey,
    pub max_new_tokens: u32,
    pub history: Vec<ChatTurn>,
    pub message: String,
    pub uploads: Vec<Upload>,
}

pub struct ChatService {
    backend: VlmBackend,
    cache: ModelCache,
    pdf: PdfRenderer,
    system_prompt: String,
}

impl ChatService {
    pub fn new(backend: VlmBackend, pdf: PdfRenderer, system_prompt: impl Into<String>) -> Self {
        Self { backend, cache: ModelCache::new(), pdf, system_prompt: system_prompt.into() }
    }

    pub fn from_config(config: &Config) -> Result<Self, VlmError> {
        let backend = providers::build(&config.vlm, config.vlm_api_key.clone())?;
        Ok(Self::new(backend, PdfRenderer::from_config(&config.pdf), config.vlm.system_prompt.clone()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Generate a complete answer.
    pub async fn run_chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let (model, generation) = self.prepare(request).await?;

        let started = Instant::now();
        let out = model.generate(generation).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        info!(
            model_id = %model.key.model_id,
            edge = model.key.max_image_edge,
            latency_ms,
            completion_tokens = out.completion_tokens,
            "chat complete"
        );
        Ok(ChatResponse {
            answer: out.text.trim().to_string(),
            usage: Usage { prompt_tokens: out.prompt_tokens, completion_tokens: out.completion_tokens, latency_ms },
        })
    }

    /// Start generation and return the stream of answer chunks.
    pub async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, ChatError> {
        let (model, generation) = self.prepare(request).await?;

        let scrubber = model.echoes_prompt().then(|| {
            let markers = render_echo(&generation.system_prompt, &generation.messages)
                .matches(ASSISTANT_MARKER)
                .count();
            MarkerScrubber::default().with_expected_markers(markers)
        });
        debug!(model_id = %model.key.model_id, scrubbed = scrubber.is_some(), "chat stream started");
        Ok(ChatStream { rx: model.stream(generation), scrubber })
    }

    async fn prepare(&self, request: ChatRequest) -> Result<(Arc<LoadedModel>, GenerationRequest), ChatError> {
        let ChatRequest { variant, max_new_tokens, history, message, uploads } = request;

        let sorted = tokio::task::spawn_blocking(move || media::sort_uploads(uploads))
            .await
            .map_err(|e| ChatError::Task(e.to_string()))?;
        let mut images = sorted.images;
        for pdf in &sorted.pdfs {
            images.extend(self.pdf.render(pdf).await?);
        }

        let edge = variant.max_image_edge;
        let images = tokio::task::spawn_blocking(move || resize_all(images, edge))
            .await
            .map_err(|e| ChatError::Task(e.to_string()))?;

        debug!(
            model_id = %variant.model_id,
            images = images.len(),
            pdfs = sorted.pdfs.len(),
            history = history.len(),
            "prompt assembled"
        );

        let model = self
            .cache
            .get_or_load(&variant, || async {
                info!(
                    model_id = %variant.model_id,
                    quant_4bit = variant.quant_4bit,
                    use_cpu = variant.use_cpu,
                    edge = variant.max_image_edge,
                    backend = self.backend_name(),
                    "loading model variant"
                );
                let model = self.backend.load(&variant).await?;
                info!(model_id = %variant.model_id, loaded_at = %model.loaded_at, "model variant loaded");
                Ok(model)
            })
            .await?;

        let generation = GenerationRequest {
            system_prompt: self.system_prompt.clone(),
            messages: build_messages(&history, &message, images),
            max_new_tokens,
        };
        Ok((model, generation))
    }
}

fn resize_all(images: Vec<DynamicImage>, max_edge: u32) -> Vec<DynamicImage> {
    images.into_iter().map(|img| media::resize_long_edge(img, max_edge)).collect()
}

/// Cleaned answer chunks, in generation order.
pub struct ChatStream {
    rx: ChunkReceiver,
    scrubber: Option<MarkerScrubber>,
}

impl ChatStream {
    /// Next chunk to forward, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<String, VlmError>> {
        loop {
            match self.rx.recv().await {
                Some(Ok(chunk)) => match &mut self.scrubber {
                    Some(s) => {
                        if let Some(out) = s.push(&chunk) {
                            return Some(Ok(out));
                        }
                    }
                    None if chunk.is_empty() => {}
                    None => return Some(Ok(chunk)),
                },
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    if let Some(dropped) = self.scrubber.as_mut().and_then(MarkerScrubber::finish) {
                        warn!(bytes = dropped.len(), "stream ended before the assistant marker; prefix discarded");
                    }
                    return None;
                }
            }
        }
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, VlmError> {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::images::to_png_bytes;
    use crate::vlm::providers::dummy::DummyBackend;
    use image::RgbImage;

    fn service() -> ChatService {
        ChatService::new(
            VlmBackend::Dummy(DummyBackend::new(0)),
            PdfRenderer::new("/nonexistent/pdftoppm", 144, None),
            "You are a helpful assistant.",
        )
    }

    fn request(message: &str, edge: u32, uploads: Vec<Upload>) -> ChatRequest {
        ChatRequest {
            variant: VariantKey {
                model_id: "Qwen/Qwen2-VL-2B-Instruct".into(),
                quant_4bit: true,
                use_cpu: false,
                max_image_edge: edge,
            },
            max_new_tokens: 64,
            history: Vec::new(),
            message: message.into(),
            uploads,
        }
    }

    fn png_upload(w: u32, h: u32) -> Upload {
        Upload {
            filename: "img.png".into(),
            content_type: Some("image/png".into()),
            bytes: to_png_bytes(&DynamicImage::ImageRgb8(RgbImage::new(w, h))).unwrap(),
        }
    }

    #[tokio::test]
    async fn loaded_variant_is_stamped() {
        let svc = service();
        assert_eq!(svc.backend_name(), "dummy");

        let before = chrono::Utc::now();
        let req = request("hi", 512, vec![]);
        let key = req.variant.clone();
        svc.run_chat(req).await.unwrap();
        let model = svc
            .cache()
            .get_or_load(&key, || async { Err(VlmError::Load("variant should already be cached".into())) })
            .await
            .unwrap();
        assert!(model.loaded_at >= before);
        assert_eq!(model.key, key);
    }

    #[tokio::test]
    async fn run_chat_resizes_and_caches() {
        let svc = service();
        let resp = svc.run_chat(request("hi", 512, vec![png_upload(1024, 256)])).await.unwrap();
        assert_eq!(resp.answer, "[echo] hi [image 1: 512x128]");
        assert!(resp.usage.prompt_tokens > 0);
        assert_eq!(svc.cache().len(), 1);

        svc.run_chat(request("again", 512, vec![])).await.unwrap();
        assert_eq!(svc.cache().len(), 1);
        svc.run_chat(request("again", 640, vec![])).await.unwrap();
        assert_eq!(svc.cache().len(), 2);
    }

    #[tokio::test]
    async fn stream_chat_scrubs_prompt_echo() {
        let svc = service();
        let mut req = request("what now", 1024, vec![]);
        req.history = vec![ChatTurn::user("hello"), ChatTurn::assistant("hi there")];
        let text = svc.stream_chat(req).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "[echo] what now");
    }

    #[tokio::test]
    async fn pdf_failure_fails_request() {
        let svc = service();
        let pdf = Upload { filename: "doc.pdf".into(), content_type: None, bytes: b"%PDF-1.4".to_vec() };
        let err = svc.run_chat(request("x", 1024, vec![pdf])).await.unwrap_err();
        assert!(matches!(err, ChatError::Media(MediaError::Pdf(_))));
        assert!(svc.cache().is_empty());
    }

    #[test]
    fn usage_serializes_with_wire_names() {
        let v = serde_json::to_value(Usage { prompt_tokens: 1, completion_tokens: 2, latency_ms: 3 }).unwrap();
        assert_eq!(v, serde_json::json!({"prompt_tokens": 1, "completion_tokens": 2, "latency_ms": 3}));
        let parsed: Usage = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, Usage::default());
    }
}
