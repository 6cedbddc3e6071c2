//! `valormm-bench`: latency sweep against a running ValorMM server.

use anyhow::Context;
use clap::Parser;

use valormm::bench::{self, BenchArgs, summary};
use valormm::logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = BenchArgs::parse();

    let level = logger::verbosity_level(args.verbose);
    logger::init(level.unwrap_or("warn"), level.is_some(), None)?;

    if args.summarize {
        let path = args.csv_path();
        let summary = summary::summarize_file(&path)
            .with_context(|| format!("no results to summarize at {} (run the benchmark first)", path.display()))?;
        print!("{}", summary::render(&summary));
        return Ok(());
    }

    bench::run(&args).await.context("benchmark failed")?;
    Ok(())
}
