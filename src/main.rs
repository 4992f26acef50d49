// src/main.rs

mod cli;
mod client;
mod config;
mod error;
mod format;
mod link;
mod mcp_server;
mod validation;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::CliArgs;
use config::Config;

fn main() -> Result<()> {
    let args = CliArgs::parse();

    match &args.decode_url {
        // CLI mode: pure synchronous decoding, no runtime or network
        Some(url) => run_decode(url),
        None => {
            let config = Config::from_args(&args).context("Invalid Metabase configuration")?;
            run_mcp_mode(config)
        }
    }
}

#[tokio::main]
async fn run_mcp_mode(config: Config) -> Result<()> {
    // Logs go to stderr; stdout carries the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Running in MCP Server mode...");
    mcp_server::start_mcp(config).await.context("MCP Server failed")
}

fn run_decode(url: &str) -> Result<()> {
    let decoded = match link::decode_dashboard_url(url) {
        Ok(decoded) => decoded,
        Err(e) => bail!(e.format_for_display()),
    };

    let output = serde_json::to_string_pretty(&decoded)
        .context("Failed to serialize decoded link")?;
    println!("{}", output);
    Ok(())
}
