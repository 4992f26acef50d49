// src/config.rs

use std::time::Duration;

use crate::cli::CliArgs;
use crate::error::{MetabaseError, Result};

/// Settings resolved once at start-up and shared read-only afterwards.
#[derive(Clone)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_rows: u32,
}

impl Config {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        max_rows: u32,
    ) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(MetabaseError::configuration("METABASE_URL"));
        }
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(MetabaseError::configuration("METABASE_API_KEY"));
        }
        if timeout.is_zero() {
            return Err(MetabaseError::configuration("METABASE_TIMEOUT_MS"));
        }
        if max_rows == 0 {
            return Err(MetabaseError::configuration("METABASE_MAX_ROWS"));
        }

        Ok(Self {
            base_url,
            api_key,
            timeout,
            max_rows,
        })
    }

    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let base_url = args
            .metabase_url
            .clone()
            .ok_or_else(|| MetabaseError::configuration("METABASE_URL"))?;
        let api_key = args
            .api_key
            .clone()
            .ok_or_else(|| MetabaseError::configuration("METABASE_API_KEY"))?;
        Self::new(
            base_url,
            api_key,
            Duration::from_millis(args.timeout_ms),
            args.max_rows,
        )
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

// Keeps the API key out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_rows", &self.max_rows)
            .finish()
    }
}
