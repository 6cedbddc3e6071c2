//! Dummy VLM backend: an in-process engine that echoes the request.
//!
//! The stream behaves like a prompt-echoing token streamer: the decoded prompt
//! first (one chunk per line), then the answer `[echo] <user text>` followed by
//! ` [image i: WxH]` for every attached image, one chunk per word. Used for
//! tests, demos and benchmarking the HTTP path without a GPU.

use std::fmt::Write as _;
use std::time::Duration;

use tracing::debug;

use crate::vlm::template::{render_chat_template, render_echo};
use crate::vlm::{ChunkSender, Generation, GenerationRequest, VariantKey, VlmError};

#[derive(Debug, Clone)]
pub struct DummyBackend {
    token_delay: Duration,
}

impl DummyBackend {
    pub fn new(token_delay_ms: u64) -> Self {
        Self { token_delay: Duration::from_millis(token_delay_ms) }
    }

    pub async fn load(&self, key: &VariantKey) -> Result<DummySession, VlmError> {
        if key.model_id.trim().is_empty() {
            return Err(VlmError::Load("model id must not be empty".into()));
        }
        debug!(model_id = %key.model_id, quant_4bit = key.quant_4bit, use_cpu = key.use_cpu, "dummy model ready");
        Ok(DummySession { token_delay: self.token_delay })
    }
}

#[derive(Debug, Clone)]
pub struct DummySession {
    token_delay: Duration,
}

impl DummySession {
    pub fn generate(&self, request: &GenerationRequest) -> Generation {
        let chunks = answer_chunks(request);
        Generation {
            prompt_tokens: prompt_tokens(request),
            completion_tokens: chunks.len() as u64,
            text: chunks.concat(),
        }
    }

    /// Blocking producer; run it on a blocking thread.
    pub fn stream(&self, request: GenerationRequest, tx: ChunkSender) {
        let echo = render_echo(&request.system_prompt, &request.messages);
        let chunks = echo
            .split_inclusive('\n')
            .map(str::to_string)
            .chain(answer_chunks(&request));

        for (i, chunk) in chunks.enumerate() {
            if i > 0 && !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            if tx.blocking_send(Ok(chunk)).is_err() {
                debug!("dummy stream receiver dropped");
                return;
            }
        }
    }
}

fn answer_text(request: &GenerationRequest) -> String {
    let Some(last) = request.messages.last() else {
        return "[echo] ".to_string();
    };
    let mut text = format!("[echo] {}", last.text());
    for (i, img) in last.images().enumerate() {
        let _ = write!(text, " [image {}: {}x{}]", i + 1, img.width(), img.height());
    }
    text
}

fn answer_chunks(request: &GenerationRequest) -> Vec<String> {
    answer_text(request)
        .split_inclusive(' ')
        .take(request.max_new_tokens as usize)
        .map(str::to_string)
        .collect()
}

/// Whitespace-delimited pieces of the templated prompt.
fn prompt_tokens(request: &GenerationRequest) -> u64 {
    render_chat_template(&request.system_prompt, &request.messages)
        .split_whitespace()
        .count() as u64
}
