//! Benchmark client for the chat API.
//!
//! Sweeps `edges × tokens × rounds` against a running server, timing each
//! request end to end, and appends one row per request to
//! `<out-dir>/results.csv`. With `--stream` the streaming endpoint is used and
//! time-to-first-token is recorded as well.

pub mod summary;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const RESULTS_FILE: &str = "results.csv";

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("io error on {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("CSV error in {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("http client error: {0}")]
    Client(String),
}

/// Loose truthiness: `1/true/yes/y/on` (any case) are true, everything else false.
pub fn parse_flag(raw: &str) -> Result<bool, String> {
    Ok(matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "valormm-bench", version, about = "Latency benchmark for the ValorMM chat API")]
pub struct BenchArgs {
    /// Backend base URL
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub server: String,

    /// Image file to attach (skipped when missing)
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// PDF file to attach (skipped when missing)
    #[arg(long)]
    pub pdf: Option<PathBuf>,

    /// Repetitions per configuration
    #[arg(long, default_value_t = 3)]
    pub rounds: u32,

    /// max_new_tokens values to test
    #[arg(long, num_args = 1.., default_values_t = [128, 256, 384, 512])]
    pub tokens: Vec<u32>,

    /// max_image_edge values to test
    #[arg(long, num_args = 1.., default_values_t = [640, 768, 896, 1024])]
    pub edges: Vec<u32>,

    /// Use 4-bit quantization
    #[arg(long = "quant-4bit", alias = "quant_4bit", action = clap::ArgAction::Set, value_parser = parse_flag, default_value = "true")]
    pub quant_4bit: bool,

    /// Force CPU inference
    #[arg(long = "use-cpu", alias = "use_cpu", action = clap::ArgAction::Set, value_parser = parse_flag, default_value = "false")]
    pub use_cpu: bool,

    /// Prompt message
    #[arg(long, default_value = "Briefly describe this content.")]
    pub message: String,

    /// Model id
    #[arg(long = "model-id", alias = "model_id", default_value = "Qwen/Qwen2-VL-2B-Instruct")]
    pub model_id: String,

    /// Directory for results.csv
    #[arg(long = "out-dir", default_value = "bench_out")]
    pub out_dir: PathBuf,

    /// Per-request timeout in seconds
    #[arg(long = "timeout-secs", default_value_t = 600)]
    pub timeout_secs: u64,

    /// Hit the streaming endpoint and record time-to-first-token
    #[arg(long)]
    pub stream: bool,

    /// Print a summary of an existing results.csv and exit
    #[arg(long)]
    pub summarize: bool,

    /// Increase logging verbosity (-v, -vv, -vvv, -vvvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl BenchArgs {
    pub fn csv_path(&self) -> PathBuf {
        self.out_dir.join(RESULTS_FILE)
    }
}

/// One CSV row. Empty cells are `None`.
#[derive(Debug, Clone, Serialize)]
pub struct BenchRow {
    pub timestamp: String,
    pub server: String,
    pub model_id: String,
    pub quant_4bit: bool,
    pub use_cpu: bool,
    pub max_image_edge: u32,
    pub max_new_tokens: u32,
    pub files: String,
    pub http_ms: u64,
    pub model_latency_ms: Option<u64>,
    pub peak_vram_mb: Option<String>,
    pub answer_chars: Option<usize>,
    pub status: String,
    pub ttft_ms: Option<u64>,
}

/// A file attached to every request; bytes are read once.
#[derive(Debug, Clone)]
struct Attachment {
    name: String,
    mime: &'static str,
    bytes: Vec<u8>,
}

/// What one request produced, before it becomes a row.
#[derive(Debug, Default)]
struct Outcome {
    status: String,
    model_latency_ms: Option<u64>,
    peak_vram_mb: Option<String>,
    answer_chars: Option<usize>,
    ttft_ms: Option<u64>,
}

fn load_attachments(args: &BenchArgs) -> Vec<Attachment> {
    let candidates = [(args.image.as_deref(), "image/jpeg"), (args.pdf.as_deref(), "application/pdf")];
    candidates
        .into_iter()
        .filter_map(|(path, mime)| {
            let path = path?;
            match std::fs::read(path) {
                Ok(bytes) => Some(Attachment { name: basename(path), mime, bytes }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping attachment");
                    None
                }
            }
        })
        .collect()
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Open `results.csv` for appending; the header is written only for a new file.
pub fn open_results(path: &Path) -> Result<csv::Writer<std::fs::File>, BenchError> {
    let io_err = |source| BenchError::Io { path: path.display().to_string(), source };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path).map_err(io_err)?;
    Ok(csv::WriterBuilder::new().has_headers(is_new).from_writer(file))
}

/// Run the sweep and return the CSV path.
pub async fn run(args: &BenchArgs) -> Result<PathBuf, BenchError> {
    let csv_path = args.csv_path();
    let mut writer = open_results(&csv_path)?;
    let csv_err = |source| BenchError::Csv { path: csv_path.display().to_string(), source };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()
        .map_err(|e| BenchError::Client(e.to_string()))?;

    let attachments = load_attachments(args);
    let files = if attachments.is_empty() {
        "none".to_string()
    } else {
        attachments.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(";")
    };
    let endpoint = if args.stream { "/api/v1/chat/stream" } else { "/api/v1/chat" };
    let target = format!("{}{endpoint}", args.server.trim_end_matches('/'));
    debug!(%target, files = %files, "starting sweep");

    for &edge in &args.edges {
        for &tokens in &args.tokens {
            for round in 1..=args.rounds {
                let form = build_form(args, edge, tokens, &attachments);
                let started = Instant::now();
                let result = if args.stream {
                    post_stream(&client, &target, form, started).await
                } else {
                    post_chat(&client, &target, form).await
                };
                let http_ms = started.elapsed().as_millis() as u64;

                let outcome = match result {
                    Ok(o) => {
                        println!(
                            "[OK] edge={edge} toks={tokens} r={round}/{} http_ms={http_ms} model_ms={} vram={}{}",
                            args.rounds,
                            display_opt(&o.model_latency_ms),
                            display_opt(&o.peak_vram_mb),
                            o.ttft_ms.map(|t| format!(" ttft_ms={t}")).unwrap_or_default(),
                        );
                        o
                    }
                    Err(e) => {
                        println!("[ERR] edge={edge} toks={tokens} r={round}/{} error={e}", args.rounds);
                        Outcome { status: format!("error:{e}"), ..Outcome::default() }
                    }
                };

                writer
                    .serialize(BenchRow {
                        timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
                        server: args.server.clone(),
                        model_id: args.model_id.clone(),
                        quant_4bit: args.quant_4bit,
                        use_cpu: args.use_cpu,
                        max_image_edge: edge,
                        max_new_tokens: tokens,
                        files: files.clone(),
                        http_ms,
                        model_latency_ms: outcome.model_latency_ms,
                        peak_vram_mb: outcome.peak_vram_mb,
                        answer_chars: outcome.answer_chars,
                        status: outcome.status,
                        ttft_ms: outcome.ttft_ms,
                    })
                    .map_err(csv_err)?;
                writer
                    .flush()
                    .map_err(|source| BenchError::Io { path: csv_path.display().to_string(), source })?;
            }
        }
    }

    println!("\nSaved CSV: {}", csv_path.display());
    Ok(csv_path)
}

fn display_opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Multipart bodies are consumed by sending, so a fresh form is built per request.
fn build_form(args: &BenchArgs, edge: u32, tokens: u32, attachments: &[Attachment]) -> Form {
    let mut form = Form::new()
        .text("message", args.message.clone())
        .text("history", "[]")
        .text("model_id", args.model_id.clone())
        .text("quant_4bit", args.quant_4bit.to_string())
        .text("use_cpu", args.use_cpu.to_string())
        .text("max_image_edge", edge.to_string())
        .text("max_new_tokens", tokens.to_string());
    for a in attachments {
        let part = Part::bytes(a.bytes.clone())
            .file_name(a.name.clone())
            .mime_str(a.mime)
            .unwrap_or_else(|_| Part::bytes(a.bytes.clone()).file_name(a.name.clone()));
        form = form.part("files", part);
    }
    form
}

async fn post_chat(client: &reqwest::Client, target: &str, form: Form) -> Result<Outcome, reqwest::Error> {
    let resp = client.post(target).multipart(form).send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    Ok(chat_outcome(status.as_u16(), &body))
}

/// Interpret a `/api/v1/chat` response body.
fn chat_outcome(status: u16, body: &str) -> Outcome {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let mut out = Outcome { status: status.to_string(), ..Outcome::default() };

    if status != 200 {
        out.answer_chars = Some(if parsed.is_some() { body.chars().count() } else { 0 });
        return out;
    }
    let Some(data) = parsed else {
        out.answer_chars = Some(0);
        return out;
    };
    let usage = data.get("usage");
    out.model_latency_ms = usage.and_then(|u| u.get("latency_ms")).and_then(Value::as_u64);
    out.peak_vram_mb = usage
        .and_then(|u| u.get("peak_vram_mb"))
        .or_else(|| data.get("peak_vram_mb"))
        .and_then(vram_cell);
    out.answer_chars = Some(data.get("answer").and_then(Value::as_str).map_or(0, |a| a.chars().count()));
    out
}

fn vram_cell(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

async fn post_stream(
    client: &reqwest::Client,
    target: &str,
    form: Form,
    started: Instant,
) -> Result<Outcome, reqwest::Error> {
    let resp = client.post(target).multipart(form).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await?;
        return Ok(chat_outcome(status.as_u16(), &body));
    }

    let mut out = Outcome { status: status.as_u16().to_string(), answer_chars: Some(0), ..Outcome::default() };
    let mut events = resp.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(e) => e,
            Err(e) => {
                out.status = format!("error:stream:{e}");
                break;
            }
        };
        if event.event == "error" {
            out.status = format!("error:{}", event.data);
            continue;
        }
        if event.data == "[DONE]" {
            break;
        }
        if out.ttft_ms.is_none() {
            out.ttft_ms = Some(started.elapsed().as_millis() as u64);
        }
        out.answer_chars = out.answer_chars.map(|n| n + event.data.chars().count());
    }
    Ok(out)
}
