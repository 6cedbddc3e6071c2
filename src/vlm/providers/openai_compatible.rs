//! OpenAI-compatible chat completion backend (`/v1/chat/completions`).
//!
//! Targets any server that hosts a Qwen2-VL checkpoint behind the OpenAI API
//! (vLLM, mistral.rs, LM Studio…). Images travel as PNG data URLs in
//! `image_url` content parts. All wire types are private to this module.
//!
//! The quantization and CPU flags of a [`VariantKey`] pick the deployment:
//! `routes` maps `full`, `4bit`, `cpu` and `cpu-4bit` to base URLs, and
//! `api_base_url` serves every variant without a route. Loading a variant
//! checks that the deployment lists the model under `GET /models`.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::config::OpenAiConfig;
use crate::media::images::to_png_bytes;
use crate::vlm::template::{ContentPart, PromptMessage};
use crate::vlm::{ChunkSender, Generation, GenerationRequest, VariantKey, VlmError};

// ── Backend ───────────────────────────────────────────────────────────────────

/// Constructed once at startup; cheap to clone (`reqwest::Client` is an `Arc`).
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    client: Client,
    api_base_url: String,
    routes: HashMap<String, String>,
    verify_model: bool,
    api_key: Option<String>,
}

impl OpenAiCompatibleBackend {
    /// `api_key` comes from `VLM_API_KEY` and is sent as a bearer token when present.
    pub fn new(config: &OpenAiConfig, api_key: Option<String>) -> Result<Self, VlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| VlmError::Request(format!("failed to build HTTP client: {e}")))?;

        let routes = config
            .routes
            .iter()
            .map(|(k, v)| (k.clone(), v.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            routes,
            verify_model: config.verify_model,
            api_key,
        })
    }

    /// Route name for a variant's quantization / device flags.
    pub fn route_name(key: &VariantKey) -> &'static str {
        match (key.use_cpu, key.quant_4bit) {
            (true, true) => "cpu-4bit",
            (true, false) => "cpu",
            (false, true) => "4bit",
            (false, false) => "full",
        }
    }

    pub fn base_url_for(&self, key: &VariantKey) -> &str {
        self.routes
            .get(Self::route_name(key))
            .map(String::as_str)
            .unwrap_or(&self.api_base_url)
    }

    pub async fn load(&self, key: &VariantKey) -> Result<OpenAiSession, VlmError> {
        let base = self.base_url_for(key).to_string();

        if self.verify_model {
            let served = self.list_models(&base).await?;
            if !served.iter().any(|id| id == &key.model_id) {
                return Err(VlmError::Load(format!(
                    "model '{}' is not served by {base} (available: {})",
                    key.model_id,
                    served.join(", ")
                )));
            }
        }

        info!(model_id = %key.model_id, route = Self::route_name(key), %base, "attached to deployment");
        Ok(OpenAiSession {
            client: self.client.clone(),
            endpoint: format!("{base}/chat/completions"),
            model: key.model_id.clone(),
            api_key: self.api_key.clone(),
        })
    }

    async fn list_models(&self, base: &str) -> Result<Vec<String>, VlmError> {
        let mut req = self.client.get(format!("{base}/models"));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| VlmError::Load(format!("deployment {base} unreachable: {e}")))?;
        let response = check_status(response).await?;
        let list = response
            .json::<ModelList>()
            .await
            .map_err(|e| VlmError::Protocol(format!("failed to parse model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One model on one deployment.
#[derive(Debug, Clone)]
pub struct OpenAiSession {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiSession {
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, VlmError> {
        let payload = self.payload(request, false).await?;
        let response = self.send(&payload).await?;

        let parsed = response.json::<ChatCompletionResponse>().await.map_err(|e| {
            error!(error = %e, "failed to deserialize completion");
            VlmError::Protocol(format!("failed to parse response body: {e}"))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| VlmError::Protocol("missing content in response".into()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Generation {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    /// Stream deltas into `tx` until `[DONE]`, end of body, or a dropped receiver.
    /// Failures are delivered through the channel.
    pub async fn stream(&self, request: GenerationRequest, tx: ChunkSender) {
        if let Err(e) = self.stream_inner(request, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    }

    async fn stream_inner(&self, request: GenerationRequest, tx: &ChunkSender) -> Result<(), VlmError> {
        let payload = self.payload(request, true).await?;
        let response = self.send(&payload).await?;

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| VlmError::Request(format!("event stream error: {e}")))?;
            if event.data.trim() == "[DONE]" {
                debug!("stream complete");
                return Ok(());
            }
            if let Some(text) = parse_delta_content(&event.data)? {
                if tx.send(Ok(text)).await.is_err() {
                    debug!("stream receiver dropped");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn payload(&self, request: GenerationRequest, stream: bool) -> Result<ChatCompletionRequest, VlmError> {
        let model = self.model.clone();
        // PNG encoding is CPU-bound.
        tokio::task::spawn_blocking(move || build_payload(model, request, stream))
            .await
            .map_err(|e| VlmError::Task(e.to_string()))?
    }

    async fn send(&self, payload: &ChatCompletionRequest) -> Result<reqwest::Response, VlmError> {
        debug!(model = %payload.model, stream = payload.stream, messages = payload.messages.len(), "sending VLM request");

        let mut req = self.client.post(&self.endpoint).json(payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| {
            error!(url = %self.endpoint, error = %e, "VLM HTTP request failed (transport)");
            VlmError::Request(e.to_string())
        })?;
        check_status(response).await
    }
}

fn build_payload(model: String, request: GenerationRequest, stream: bool) -> Result<ChatCompletionRequest, VlmError> {
    let mut messages = vec![WireMessage {
        role: "system",
        content: WireContent::Text(request.system_prompt),
    }];
    for msg in &request.messages {
        messages.push(wire_message(msg)?);
    }
    trace!(messages = messages.len(), stream, "built chat payload");
    Ok(ChatCompletionRequest {
        model,
        messages,
        max_tokens: request.max_new_tokens,
        temperature: 0.0,
        top_p: 1.0,
        stream,
    })
}

/// Text-only messages use plain string content; messages with images use parts.
fn wire_message(msg: &PromptMessage) -> Result<WireMessage, VlmError> {
    let role = msg.role.as_str();
    if msg.images().next().is_none() {
        return Ok(WireMessage { role, content: WireContent::Text(msg.text()) });
    }
    let parts = msg
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => Ok(WirePart::Text { text: text.clone() }),
            ContentPart::Image(img) => {
                let png = to_png_bytes(img).map_err(|e| VlmError::Request(e.to_string()))?;
                Ok(WirePart::ImageUrl {
                    image_url: ImageUrl { url: format!("data:image/png;base64,{}", BASE64.encode(png)) },
                })
            }
        })
        .collect::<Result<Vec<_>, VlmError>>()?;
    Ok(WireMessage { role, content: WireContent::Parts(parts) })
}

/// Extract `choices[0].delta.content` from a streaming chunk.
pub(crate) fn parse_delta_content(data: &str) -> Result<Option<String>, VlmError> {
    let chunk: ChunkResponse = serde_json::from_str(data)
        .map_err(|e| VlmError::Protocol(format!("bad stream chunk: {e}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty()))
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageData {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Return the response if successful, otherwise a structured error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => format!("HTTP {status}: {}", env.error.message),
        Err(_) => format!("HTTP {status}: {body}"),
    };

    error!(%status, %message, "VLM request returned HTTP error");
    Err(VlmError::Request(message))
}
