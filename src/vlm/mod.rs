//! Vision-language model abstraction.
//!
//! `VlmBackend` is an enum over concrete inference backends; `load` turns a
//! [`VariantKey`] into a [`LoadedModel`] that the [`cache::ModelCache`] keeps
//! for the life of the process. Adding a backend = new module in
//! `providers/` + new variant here + new arms in `load` and `ModelSession`.
//!
//! Generation itself happens outside this crate (in-process echo engine or an
//! OpenAI-compatible server); this layer only moves prompts in and text out.

pub mod cache;
pub mod providers;
pub mod scrub;
pub mod template;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use providers::dummy::{DummyBackend, DummySession};
use providers::openai_compatible::{OpenAiCompatibleBackend, OpenAiSession};
use template::PromptMessage;

/// Capacity of the producer → consumer chunk channel.
const CHUNK_BUFFER: usize = 64;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum VlmError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("model load failed: {0}")]
    Load(String),
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("malformed backend response: {0}")]
    Protocol(String),
    #[error("generation task failed: {0}")]
    Task(String),
}

// ── Request / response types ──────────────────────────────────────────────────

/// Everything that selects a distinct loaded model. Requests that differ only
/// in prompt content share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub model_id: String,
    pub quant_4bit: bool,
    pub use_cpu: bool,
    pub max_image_edge: u32,
}

/// A fully assembled prompt ready for generation. Images are already resized.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub messages: Vec<PromptMessage>,
    pub max_new_tokens: u32,
}

/// One-shot generation result. Token counts are whatever the backend reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub type ChunkSender = mpsc::Sender<Result<String, VlmError>>;
pub type ChunkReceiver = mpsc::Receiver<Result<String, VlmError>>;

// ── Backend enum ──────────────────────────────────────────────────────────────

/// All available inference backends. Cheap to clone.
#[derive(Debug, Clone)]
pub enum VlmBackend {
    Dummy(DummyBackend),
    OpenAiCompatible(OpenAiCompatibleBackend),
}

impl VlmBackend {
    pub fn name(&self) -> &'static str {
        match self {
            VlmBackend::Dummy(_) => "dummy",
            VlmBackend::OpenAiCompatible(_) => "openai",
        }
    }

    /// Load (or attach to) the model for `key`. Called once per variant by the cache.
    pub async fn load(&self, key: &VariantKey) -> Result<LoadedModel, VlmError> {
        let session = match self {
            VlmBackend::Dummy(b) => ModelSession::Dummy(b.load(key).await?),
            VlmBackend::OpenAiCompatible(b) => ModelSession::OpenAiCompatible(b.load(key).await?),
        };
        Ok(LoadedModel { key: key.clone(), loaded_at: Utc::now(), session })
    }
}

// ── Loaded model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ModelSession {
    Dummy(DummySession),
    OpenAiCompatible(OpenAiSession),
}

/// A model handle for one [`VariantKey`], shared by every request for that variant.
#[derive(Debug)]
pub struct LoadedModel {
    pub key: VariantKey,
    pub loaded_at: DateTime<Utc>,
    session: ModelSession,
}

impl LoadedModel {
    /// Whether the token stream starts with the decoded prompt and must be
    /// scrubbed before it reaches a client.
    pub fn echoes_prompt(&self) -> bool {
        matches!(self.session, ModelSession::Dummy(_))
    }

    /// Generate a complete answer (no prompt echo).
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation, VlmError> {
        match &self.session {
            ModelSession::Dummy(s) => {
                let s = s.clone();
                tokio::task::spawn_blocking(move || s.generate(&request))
                    .await
                    .map_err(|e| VlmError::Task(e.to_string()))
            }
            ModelSession::OpenAiCompatible(s) => s.generate(request).await,
        }
    }

    /// Start generation on a producer task and return the receiving end.
    ///
    /// Chunks arrive in generation order. Dropping the receiver stops the
    /// producer at its next send.
    pub fn stream(&self, request: GenerationRequest) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        match &self.session {
            ModelSession::Dummy(s) => {
                let s = s.clone();
                tokio::task::spawn_blocking(move || s.stream(request, tx));
            }
            ModelSession::OpenAiCompatible(s) => {
                let s = s.clone();
                tokio::spawn(async move { s.stream(request, tx).await });
            }
        }
        rx
    }
}
