//! VLM backend implementations.
//!
//! `build(config, api_key)` is the factory, called at startup.
//! Adding a new backend = new module + new match arm.

pub mod dummy;
pub mod openai_compatible;

use crate::config::VlmConfig;
use crate::vlm::{VlmBackend, VlmError};

/// Construct a `VlmBackend` from config and an optional API key.
///
/// `api_key` is sourced from `VLM_API_KEY` env (never TOML) and is `None`
/// for keyless local deployments.
pub fn build(config: &VlmConfig, api_key: Option<String>) -> Result<VlmBackend, VlmError> {
    match config.backend.as_str() {
        "dummy" => Ok(VlmBackend::Dummy(dummy::DummyBackend::new(config.dummy.token_delay_ms))),
        "openai" | "openai-compatible" => {
            let b = openai_compatible::OpenAiCompatibleBackend::new(&config.openai, api_key)?;
            Ok(VlmBackend::OpenAiCompatible(b))
        }
        other => Err(VlmError::UnknownBackend(other.to_string())),
    }
}
