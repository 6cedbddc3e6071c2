//! ValorMM API server entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Build the inference backend and chat service
//!   6. Spawn Ctrl-C → shutdown signal watcher
//!   7. Serve HTTP until shutdown

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use valormm::chat::ChatService;
use valormm::comms::http::{self, HttpState};
use valormm::config::{self, Config};
use valormm::error::AppError;
use valormm::logger;

#[derive(Debug, Parser)]
#[command(name = "valormm", version, about = "Vision-language chat API")]
struct Cli {
    /// Path to configuration file (default: config/default.toml)
    #[arg(short = 'f', long = "config")]
    config: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv, -vvvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    let cli_level = logger::verbosity_level(cli.verbose);
    let effective_log_level = cli_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, cli_level.is_some(), config.server.log_file.as_deref())?;

    info!(
        bind = %config.server.bind,
        backend = %config.vlm.backend,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let chat = ChatService::from_config(&config)?;
    info!(backend = chat.backend_name(), "inference backend ready");
    let router = http::build_router(HttpState::new(chat, config.defaults.clone()), &config.server);

    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    print_startup_summary(&config);

    http::serve(router, &config.server.bind, shutdown).await?;

    let _ = { use std::io::Write as _; std::io::stderr().flush() };
    Ok(())
}

fn print_startup_summary(config: &Config) {
    let fit = |text: String| -> String {
        const WIDTH: usize = 58;
        let char_count = text.chars().count();
        if char_count >= WIDTH {
            let mut out = text.chars().take(WIDTH - 1).collect::<String>();
            out.push('…');
            out
        } else {
            format!("{text:<WIDTH$}")
        }
    };

    let backend_line = match config.vlm.backend.as_str() {
        "dummy" => format!("dummy (token delay {}ms)", config.vlm.dummy.token_delay_ms),
        other => {
            let mut routes: Vec<&String> = config.vlm.openai.routes.keys().collect();
            routes.sort();
            let routes = if routes.is_empty() {
                "none".to_string()
            } else {
                routes.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(",")
            };
            format!("{other} {} routes={routes}", config.vlm.openai.api_base_url)
        }
    };
    let defaults = &config.defaults;
    let pdf_pages = config.pdf.max_pages.map_or_else(|| "all".to_string(), |n| n.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ 👁️  ValorMM API                                               ║");
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║ 🧠 PID: {:<52}║", std::process::id());
    println!("║ 🌐 Bind: {:<51}║", config.server.bind);
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║ 🧩 Backend                                                   ║");
    println!("║   {}║", fit(backend_line));
    println!("╟──────────────────────────────────────────────────────────────╢");
    println!("║ ⚙️  Defaults                                                 ║");
    println!("║   {}║", fit(format!("model={}", defaults.model_id)));
    println!(
        "║   {}║",
        fit(format!(
            "4bit={} cpu={} edge={} tokens={}",
            defaults.quant_4bit, defaults.use_cpu, defaults.max_image_edge, defaults.max_new_tokens
        ))
    );
    println!(
        "║   {}║",
        fit(format!("pdf: {} @ {}dpi, pages={pdf_pages}", config.pdf.renderer, config.pdf.dpi))
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
}
