// src/cli.rs

use clap::Parser;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ROWS: u32 = 100;

#[derive(Parser, Debug)]
#[command(author, version, about = "MCP server exposing the Metabase REST API as tools.", long_about = None)]
pub struct CliArgs {
    /// Base URL of the Metabase instance, e.g. https://metabase.example.com
    #[arg(long, env = "METABASE_URL", value_name = "URL")]
    pub metabase_url: Option<String>,

    /// API key sent as X-API-Key on every request.
    #[arg(long, env = "METABASE_API_KEY", value_name = "KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "METABASE_TIMEOUT_MS", value_name = "MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Maximum number of result rows rendered for query tools.
    #[arg(long, env = "METABASE_MAX_ROWS", value_name = "N", default_value_t = DEFAULT_MAX_ROWS)]
    pub max_rows: u32,

    /// Decode a shareable question link, print its payload as JSON and exit.
    /// No connection to Metabase is made in this mode.
    #[arg(long = "decode", value_name = "LINK")]
    pub decode_url: Option<String>,
}
