//! Multipart form parsing for the chat endpoints.

use axum::extract::Multipart;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;

use crate::chat::ChatRequest;
use crate::config::ChatDefaults;
use crate::media::Upload;
use crate::vlm::VariantKey;
use crate::vlm::template::parse_history;

#[derive(Debug, thiserror::Error)]
pub(super) enum FormError {
    #[error("invalid value for '{field}': {value:?} ({reason})")]
    Invalid { field: &'static str, value: String, reason: &'static str },
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
}

impl FormError {
    pub(super) fn status(&self) -> StatusCode {
        match self {
            FormError::Invalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            FormError::Multipart(e) => e.status(),
        }
    }
}

/// Read every field of the chat form, falling back to `defaults` for omitted ones.
/// Unknown fields are ignored.
pub(super) async fn parse_chat_form(
    mut multipart: Multipart,
    defaults: &ChatDefaults,
) -> Result<ChatRequest, FormError> {
    let mut message = String::new();
    let mut history = String::new();
    let mut variant = VariantKey {
        model_id: defaults.model_id.clone(),
        quant_4bit: defaults.quant_4bit,
        use_cpu: defaults.use_cpu,
        max_image_edge: defaults.max_image_edge,
    };
    let mut max_new_tokens = defaults.max_new_tokens;
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await?;
                // Browsers send an empty part when no file was picked.
                if filename.is_empty() && bytes.is_empty() {
                    continue;
                }
                uploads.push(Upload { filename, content_type, bytes: bytes.to_vec() });
            }
            "message" => message = field.text().await?,
            "history" => history = field.text().await?,
            "model_id" => {
                let v = field.text().await?;
                if !v.trim().is_empty() {
                    variant.model_id = v.trim().to_string();
                }
            }
            "quant_4bit" => variant.quant_4bit = parse_bool("quant_4bit", &field.text().await?)?,
            "use_cpu" => variant.use_cpu = parse_bool("use_cpu", &field.text().await?)?,
            "max_image_edge" => {
                variant.max_image_edge = parse_u32("max_image_edge", &field.text().await?)?;
                if variant.max_image_edge == 0 {
                    return Err(FormError::Invalid {
                        field: "max_image_edge",
                        value: "0".into(),
                        reason: "must be positive",
                    });
                }
            }
            "max_new_tokens" => max_new_tokens = parse_u32("max_new_tokens", &field.text().await?)?,
            _ => {}
        }
    }

    Ok(ChatRequest { variant, max_new_tokens, history: parse_history(&history), message, uploads })
}

pub(super) fn parse_bool(field: &'static str, raw: &str) -> Result<bool, FormError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(FormError::Invalid { field, value: raw.to_string(), reason: "expected a boolean" }),
    }
}

pub(super) fn parse_u32(field: &'static str, raw: &str) -> Result<u32, FormError> {
    raw.trim()
        .parse()
        .map_err(|_| FormError::Invalid { field, value: raw.to_string(), reason: "expected a non-negative integer" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bools() {
        for raw in ["true", "TRUE", " 1 ", "yes", "On"] {
            assert!(parse_bool("f", raw).unwrap(), "{raw}");
        }
        for raw in ["false", "0", "No", "off"] {
            assert!(!parse_bool("f", raw).unwrap(), "{raw}");
        }
        let err = parse_bool("use_cpu", "maybe").unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("use_cpu"));
    }

    #[test]
    fn integers() {
        assert_eq!(parse_u32("f", " 768 ").unwrap(), 768);
        assert!(parse_u32("f", "-1").is_err());
        assert!(parse_u32("f", "12.5").is_err());
        assert!(parse_u32("f", "").is_err());
    }
}
