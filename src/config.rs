//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the path given with `-f`), then applies
//! `VALORMM_BIND` and `VALORMM_LOG_LEVEL` env overrides. When no file is given
//! and the default file is absent, built-in defaults are used.
//! `VLM_API_KEY` is read from the environment only, never from TOML.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;

/// HTTP listener configuration (`[server]`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind the API to.
    pub bind: String,
    /// Origins allowed by the CORS layer.
    pub cors_origins: Vec<String>,
    /// Upper bound for a multipart request body, in MiB.
    pub max_upload_mb: usize,
    /// Optional log file; stderr when `None`.
    pub log_file: Option<PathBuf>,
}

/// Form-field defaults applied when a request omits a field (`[defaults]`).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatDefaults {
    pub model_id: String,
    pub quant_4bit: bool,
    pub use_cpu: bool,
    pub max_image_edge: u32,
    pub max_new_tokens: u32,
}

/// In-process echo engine (`[vlm.dummy]`).
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Artificial delay between emitted chunks.
    pub token_delay_ms: u64,
}

/// OpenAI-compatible deployment (`[vlm.openai]`).
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL ending in `/v1`; `/chat/completions` and `/models` are appended.
    pub api_base_url: String,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
    /// Check `GET /models` lists the model before caching a variant.
    pub verify_model: bool,
    /// Variant route (`full`, `4bit`, `cpu`, `cpu-4bit`) -> base URL override.
    pub routes: HashMap<String, String>,
}

/// Inference backend selection (`[vlm]`).
#[derive(Debug, Clone)]
pub struct VlmConfig {
    /// `"dummy"` or `"openai"`.
    pub backend: String,
    pub system_prompt: String,
    pub dummy: DummyConfig,
    pub openai: OpenAiConfig,
}

/// PDF page rasterizer (`[pdf]`).
#[derive(Debug, Clone)]
pub struct PdfConfig {
    /// Path or name of the `pdftoppm` binary.
    pub renderer: String,
    pub dpi: u32,
    /// Render at most this many pages per document; all pages when `None`.
    pub max_pages: Option<u32>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub server: ServerConfig,
    pub defaults: ChatDefaults,
    pub vlm: VlmConfig,
    pub pdf: PdfConfig,
    /// Bearer token for the OpenAI-compatible backend, from `VLM_API_KEY`.
    pub vlm_api_key: Option<String>,
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    vlm: RawVlm,
    #[serde(default)]
    pdf: RawPdf,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_cors_origins")]
    cors_origins: Vec<String>,
    #[serde(default = "default_max_upload_mb")]
    max_upload_mb: usize,
    #[serde(default)]
    log_file: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
            max_upload_mb: default_max_upload_mb(),
            log_file: None,
        }
    }
}

#[derive(Deserialize)]
struct RawDefaults {
    #[serde(default = "default_model_id")]
    model_id: String,
    #[serde(default = "default_true")]
    quant_4bit: bool,
    #[serde(default)]
    use_cpu: bool,
    #[serde(default = "default_max_image_edge")]
    max_image_edge: u32,
    #[serde(default = "default_max_new_tokens")]
    max_new_tokens: u32,
}

impl Default for RawDefaults {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            quant_4bit: true,
            use_cpu: false,
            max_image_edge: default_max_image_edge(),
            max_new_tokens: default_max_new_tokens(),
        }
    }
}

#[derive(Deserialize)]
struct RawVlm {
    #[serde(default = "default_backend")]
    backend: String,
    #[serde(default = "default_system_prompt")]
    system_prompt: String,
    #[serde(default)]
    dummy: RawDummy,
    #[serde(default)]
    openai: RawOpenAi,
}

impl Default for RawVlm {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            system_prompt: default_system_prompt(),
            dummy: RawDummy::default(),
            openai: RawOpenAi::default(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawDummy {
    #[serde(default)]
    token_delay_ms: u64,
}

#[derive(Deserialize)]
struct RawOpenAi {
    #[serde(default = "default_openai_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_openai_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default = "default_true")]
    verify_model: bool,
    #[serde(default)]
    routes: HashMap<String, String>,
}

impl Default for RawOpenAi {
    fn default() -> Self {
        Self {
            api_base_url: default_openai_api_base_url(),
            timeout_seconds: default_openai_timeout_seconds(),
            verify_model: true,
            routes: HashMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct RawPdf {
    #[serde(default = "default_pdf_renderer")]
    renderer: String,
    #[serde(default = "default_pdf_dpi")]
    dpi: u32,
    /// `0` means no cap.
    #[serde(default)]
    max_pages: u32,
}

impl Default for RawPdf {
    fn default() -> Self {
        Self { renderer: default_pdf_renderer(), dpi: default_pdf_dpi(), max_pages: 0 }
    }
}

fn default_bind() -> String { "127.0.0.1:8000".to_string() }
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string(), "http://127.0.0.1:3000".to_string()]
}
fn default_max_upload_mb() -> usize { 64 }
fn default_model_id() -> String { "Qwen/Qwen2-VL-2B-Instruct".to_string() }
fn default_max_image_edge() -> u32 { 1024 }
fn default_max_new_tokens() -> u32 { 512 }
fn default_backend() -> String { "dummy".to_string() }
fn default_system_prompt() -> String { "You are a helpful assistant.".to_string() }
fn default_openai_api_base_url() -> String { "http://127.0.0.1:8001/v1".to_string() }
fn default_openai_timeout_seconds() -> u64 { 600 }
fn default_pdf_renderer() -> String { "pdftoppm".to_string() }
fn default_pdf_dpi() -> u32 { 144 }
fn default_log_level() -> String { "info".to_string() }

fn default_true() -> bool {
    true
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load config from the given path, or `config/default.toml`, then apply env-var overrides.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let bind_override = env::var("VALORMM_BIND").ok();
    let log_level_override = env::var("VALORMM_LOG_LEVEL").ok();
    let api_key = env::var("VLM_API_KEY").ok().filter(|k| !k.is_empty());

    let path = match config_path {
        Some(p) => Some(PathBuf::from(p)),
        None => {
            let default_path = PathBuf::from("config/default.toml");
            default_path.exists().then_some(default_path)
        }
    };

    let mut config = match path {
        Some(p) => load_from(&p, bind_override.as_deref(), log_level_override.as_deref())?,
        None => resolve(RawConfig::default(), bind_override.as_deref(), log_level_override.as_deref())?,
    };
    config.vlm_api_key = api_key;
    Ok(config)
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    bind_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    resolve(parsed, bind_override, log_level_override)
}

fn resolve(
    parsed: RawConfig,
    bind_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    if parsed.defaults.max_image_edge == 0 {
        return Err(AppError::Config("defaults.max_image_edge must be positive".into()));
    }
    if parsed.pdf.dpi == 0 {
        return Err(AppError::Config("pdf.dpi must be positive".into()));
    }
    if parsed.server.max_upload_mb == 0 {
        return Err(AppError::Config("server.max_upload_mb must be positive".into()));
    }

    let log_level = log_level_override
        .map(str::to_string)
        .or(parsed.log_level)
        .unwrap_or_else(default_log_level);

    Ok(Config {
        log_level,
        server: ServerConfig {
            bind: bind_override.map(str::to_string).unwrap_or(parsed.server.bind),
            cors_origins: parsed.server.cors_origins,
            max_upload_mb: parsed.server.max_upload_mb,
            log_file: parsed.server.log_file.as_deref().map(expand_home),
        },
        defaults: ChatDefaults {
            model_id: parsed.defaults.model_id,
            quant_4bit: parsed.defaults.quant_4bit,
            use_cpu: parsed.defaults.use_cpu,
            max_image_edge: parsed.defaults.max_image_edge,
            max_new_tokens: parsed.defaults.max_new_tokens,
        },
        vlm: VlmConfig {
            backend: parsed.vlm.backend,
            system_prompt: parsed.vlm.system_prompt,
            dummy: DummyConfig { token_delay_ms: parsed.vlm.dummy.token_delay_ms },
            openai: OpenAiConfig {
                api_base_url: parsed.vlm.openai.api_base_url.trim_end_matches('/').to_string(),
                timeout_seconds: parsed.vlm.openai.timeout_seconds,
                verify_model: parsed.vlm.openai.verify_model,
                routes: parsed.vlm.openai.routes,
            },
        },
        pdf: PdfConfig {
            renderer: parsed.pdf.renderer,
            dpi: parsed.pdf.dpi,
            max_pages: (parsed.pdf.max_pages > 0).then_some(parsed.pdf.max_pages),
        },
        vlm_api_key: None,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Built-in defaults with the dummy backend and no API key.
    /// Used by tests and as the base for in-process servers.
    pub fn test_default() -> Self {
        let mut cfg = resolve(RawConfig::default(), None, None)
            .unwrap_or_else(|e| unreachable!("built-in defaults are valid: {e}"));
        cfg.vlm.backend = "dummy".into();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_file_uses_defaults() {
        let f = write_toml("");
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8000");
        assert_eq!(cfg.defaults.model_id, "Qwen/Qwen2-VL-2B-Instruct");
        assert!(cfg.defaults.quant_4bit);
        assert!(!cfg.defaults.use_cpu);
        assert_eq!(cfg.defaults.max_image_edge, 1024);
        assert_eq!(cfg.defaults.max_new_tokens, 512);
        assert_eq!(cfg.vlm.backend, "dummy");
        assert_eq!(cfg.pdf.dpi, 144);
        assert_eq!(cfg.pdf.max_pages, None);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.server.cors_origins.len(), 2);
    }

    #[test]
    fn parse_full_config() {
        let f = write_toml(
            r#"
log_level = "debug"

[server]
bind = "0.0.0.0:9000"
cors_origins = ["http://example.test"]
max_upload_mb = 8

[defaults]
model_id = "Qwen/Qwen2-VL-7B-Instruct"
quant_4bit = false
max_image_edge = 768

[vlm]
backend = "openai"

[vlm.openai]
api_base_url = "http://gpu-box:8001/v1/"
verify_model = false

[vlm.openai.routes]
cpu = "http://cpu-box:8001/v1"

[pdf]
dpi = 96
max_pages = 4
"#,
        );
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.server.max_upload_mb, 8);
        assert_eq!(cfg.defaults.model_id, "Qwen/Qwen2-VL-7B-Instruct");
        assert!(!cfg.defaults.quant_4bit);
        assert_eq!(cfg.defaults.max_image_edge, 768);
        assert_eq!(cfg.defaults.max_new_tokens, 512);
        assert_eq!(cfg.vlm.backend, "openai");
        assert_eq!(cfg.vlm.openai.api_base_url, "http://gpu-box:8001/v1");
        assert!(!cfg.vlm.openai.verify_model);
        assert_eq!(cfg.vlm.openai.routes.get("cpu").unwrap(), "http://cpu-box:8001/v1");
        assert_eq!(cfg.pdf.dpi, 96);
        assert_eq!(cfg.pdf.max_pages, Some(4));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None, None);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn invalid_toml_errors() {
        let f = write_toml("[server\nbind = 1");
        let msg = load_from(f.path(), None, None).unwrap_err().to_string();
        assert!(msg.contains("parse error"));
    }

    #[test]
    fn zero_edge_rejected() {
        let f = write_toml("[defaults]\nmax_image_edge = 0\n");
        assert!(load_from(f.path(), None, None).is_err());
    }

    #[test]
    fn env_overrides_win() {
        let f = write_toml("log_level = \"warn\"\n[server]\nbind = \"127.0.0.1:1\"\n");
        let cfg = load_from(f.path(), Some("127.0.0.1:2"), Some("trace")).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:2");
        assert_eq!(cfg.log_level, "trace");
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/valormm.log");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with("valormm.log"));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/var/log/valormm.log"), PathBuf::from("/var/log/valormm.log"));
    }

    #[test]
    fn test_default_is_dummy() {
        let cfg = Config::test_default();
        assert_eq!(cfg.vlm.backend, "dummy");
        assert!(cfg.vlm_api_key.is_none());
    }
}
