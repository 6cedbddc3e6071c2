//! Multimodal prompt assembly for the Qwen2-VL chat template.
//!
//! [`build_messages`] lays out history + the new user turn, [`render_chat_template`]
//! produces the ChatML prompt a tokenizer would see, and [`render_echo`] produces
//! the same prompt as a streamer decodes it with special tokens skipped. The
//! echo form is what a prompt-echoing backend emits before the answer.

use image::DynamicImage;
use serde_json::Value;

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
pub const VISION_START: &str = "<|vision_start|>";
pub const IMAGE_PAD: &str = "<|image_pad|>";
pub const VISION_END: &str = "<|vision_end|>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One prior turn of conversation, text only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Image(DynamicImage),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl PromptMessage {
    pub fn images(&self) -> impl Iterator<Item = &DynamicImage> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::Image(img) => Some(img),
            ContentPart::Text(_) => None,
        })
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect()
    }
}

/// Parse the `history` form field.
///
/// Anything that is not a JSON array yields an empty history. Array entries
/// that are not objects are skipped. `role == "user"` maps to [`Role::User`],
/// every other role to [`Role::Assistant`]; missing content is empty, and
/// non-string content is rendered as JSON text.
pub fn parse_history(raw: &str) -> Vec<ChatTurn> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .map(|obj| {
            let role = match obj.get("role").and_then(Value::as_str) {
                Some("user") => Role::User,
                _ => Role::Assistant,
            };
            let content = match obj.get("content") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            ChatTurn { role, content }
        })
        .collect()
}

/// History turns become text-only messages; the new user turn carries every
/// image in order, followed by the user text.
pub fn build_messages(
    history: &[ChatTurn],
    user_text: &str,
    images: Vec<DynamicImage>,
) -> Vec<PromptMessage> {
    let mut msgs: Vec<PromptMessage> = history
        .iter()
        .map(|h| PromptMessage { role: h.role, parts: vec![ContentPart::Text(h.content.clone())] })
        .collect();

    let mut parts: Vec<ContentPart> = images.into_iter().map(ContentPart::Image).collect();
    parts.push(ContentPart::Text(user_text.to_string()));
    msgs.push(PromptMessage { role: Role::User, parts });
    msgs
}

/// ChatML prompt with vision placeholders and the assistant generation prompt.
pub fn render_chat_template(system: &str, messages: &[PromptMessage]) -> String {
    let mut out = format!("{IM_START}system\n{system}{IM_END}\n");
    for msg in messages {
        out.push_str(IM_START);
        out.push_str(msg.role.as_str());
        out.push('\n');
        for part in &msg.parts {
            match part {
                ContentPart::Image(_) => {
                    out.push_str(VISION_START);
                    out.push_str(IMAGE_PAD);
                    out.push_str(VISION_END);
                }
                ContentPart::Text(t) => out.push_str(t),
            }
        }
        out.push_str(IM_END);
        out.push('\n');
    }
    out.push_str(IM_START);
    out.push_str("assistant\n");
    out
}

/// The prompt as decoded with special tokens skipped: role headers and text survive,
/// control and vision tokens vanish.
pub fn render_echo(system: &str, messages: &[PromptMessage]) -> String {
    let mut out = format!("system\n{system}\n");
    for msg in messages {
        out.push_str(msg.role.as_str());
        out.push('\n');
        out.push_str(&msg.text());
        out.push('\n');
    }
    out.push_str("assistant\n");
    out
}
