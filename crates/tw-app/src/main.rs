//! TradeWatch - Entry Point
//!
//! Replays a JSON-lines event file through the listing pipeline and prints
//! the resulting page as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::info;

/// Live trade listing pipeline
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TRADEWATCH_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// JSON-lines file of replay events
    #[arg(short, long)]
    replay: PathBuf,

    /// Also print metrics in the Prometheus text format
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = tw_app::AppConfig::load(args.config.as_deref())?;
    tw_telemetry::init_logging(&config.telemetry.log_level)?;

    info!("Starting TradeWatch v{}", env!("CARGO_PKG_VERSION"));
    info!(
        debounce_ms = config.pipeline.debounce_ms,
        page_size = config.pipeline.default_page_size,
        "Configuration loaded"
    );

    let file = std::fs::File::open(&args.replay)
        .with_context(|| format!("Failed to open replay file {}", args.replay.display()))?;

    let mut app = tw_app::Application::new(config)?;
    app.replay(BufReader::new(file)).await?;

    let snapshot = app.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if args.metrics {
        print!("{}", app.handle().metrics().gather_text()?);
    }

    app.shutdown().await?;
    Ok(())
}
