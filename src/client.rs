// src/client.rs

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::config::Config;
use crate::error::{excerpt, MetabaseError, Result};

/// Characters of a non-JSON success body kept for diagnostics.
const NON_JSON_EXCERPT_CHARS: usize = 500;

const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Per-call options. Headers are merged over the defaults, not swapped in wholesale.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

}

/// Authenticated, timeout-bounded access to the Metabase REST API.
///
/// Holds no per-call state: every request owns its own deadline, and nothing
/// is retried since most of the wrapped writes are not idempotent.
#[derive(Clone)]
pub struct MetabaseClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl MetabaseClient {
    pub fn new(config: Arc<Config>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.request(endpoint, RequestOptions::new(Method::GET)).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.request(endpoint, RequestOptions::new(Method::POST).with_body(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.request(endpoint, RequestOptions::new(Method::PUT).with_body(body))
            .await
    }

    /// Perform one call and classify the outcome.
    ///
    /// Resolves to the parsed JSON body, or to exactly one of: `Timeout` when the
    /// deadline passes first, `Api` with the real status for non-2xx and non-JSON
    /// responses, `Api` with status `0` for transport and decoding failures.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let operation = format!("{} {}", options.method, endpoint);
        tracing::debug!("Metabase request: {}", operation);

        // Dropping the in-flight future on expiry aborts the request; a completed
        // call drops the timer along with the `Timeout` future.
        match tokio::time::timeout(self.config.timeout, self.execute(endpoint, options)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!("Metabase request {} failed: {}", operation, e);
                Err(e)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    "Metabase request {} timed out after {}ms",
                    operation,
                    self.config.timeout_ms()
                );
                Err(MetabaseError::timeout(operation, self.config.timeout_ms()))
            }
        }
    }

    async fn execute(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let headers = self.merged_headers(options.headers, endpoint)?;

        let mut builder = self.http.request(options.method, &url).headers(headers);
        if let Some(body) = &options.body {
            builder = builder.body(body.to_string());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MetabaseError::api(0, endpoint, e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MetabaseError::api(status.as_u16(), endpoint, text));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_json_media_type);

        let text = response
            .text()
            .await
            .map_err(|e| MetabaseError::api(0, endpoint, e.to_string()))?;

        if !is_json {
            return Err(MetabaseError::api(
                status.as_u16(),
                endpoint,
                excerpt(&text, NON_JSON_EXCERPT_CHARS),
            ));
        }

        parse_json_body(status, endpoint, &text)
    }

    fn merged_headers(&self, overrides: HeaderMap, endpoint: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let api_key = HeaderValue::from_str(&self.config.api_key).map_err(|e| {
            MetabaseError::api(0, endpoint, format!("Invalid API key header value: {}", e))
        })?;
        headers.insert(API_KEY_HEADER, api_key);

        for (name, value) in overrides.iter() {
            headers.insert(name.clone(), value.clone());
        }
        Ok(headers)
    }
}

fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

fn parse_json_body(status: StatusCode, endpoint: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| {
        tracing::debug!("Invalid JSON body from {} (status {}): {}", endpoint, status, e);
        MetabaseError::api(0, endpoint, format!("Invalid JSON in response: {}", e))
    })
}
