// src/error.rs

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Longest response excerpt carried in a rendered error message.
const DISPLAY_EXCERPT_CHARS: usize = 500;

/// The closed set of failure kinds every tool handler has to deal with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    #[error("Invalid value for '{field}': {reason}")]
    Validation {
        field: String,
        value: Value,
        reason: String,
    },

    #[error("API request to {endpoint} failed with status {status_code}")]
    Api {
        status_code: u16,
        endpoint: String,
        response_text: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Missing or invalid configuration: {key}")]
    Configuration { key: String },
}

#[derive(Error, Debug, Clone)]
#[error("{kind}")]
pub struct MetabaseError {
    kind: ErrorKind,
    timestamp: DateTime<Utc>,
}

impl MetabaseError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn validation(
        field: impl Into<String>,
        value: impl Into<Value>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Validation {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        })
    }

    pub fn api(
        status_code: u16,
        endpoint: impl Into<String>,
        response_text: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Api {
            status_code,
            endpoint: endpoint.into(),
            response_text: response_text.into(),
        })
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(ErrorKind::Timeout {
            operation: operation.into(),
            timeout_ms,
        })
    }

    pub fn configuration(key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration { key: key.into() })
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// Machine-readable code, unique per kind.
    pub fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::Validation { .. } => "VALIDATION_ERROR",
            ErrorKind::Api { .. } => "API_ERROR",
            ErrorKind::Timeout { .. } => "TIMEOUT_ERROR",
            ErrorKind::Configuration { .. } => "CONFIGURATION_ERROR",
        }
    }

    pub fn details(&self) -> Map<String, Value> {
        let details = match &self.kind {
            ErrorKind::Validation { field, value, .. } => json!({
                "field": field,
                "value": value,
            }),
            ErrorKind::Api {
                status_code,
                endpoint,
                response_text,
            } => json!({
                "statusCode": status_code,
                "endpoint": endpoint,
                "responseText": response_text,
            }),
            ErrorKind::Timeout {
                operation,
                timeout_ms,
            } => json!({
                "operation": operation,
                "timeoutMs": timeout_ms,
            }),
            ErrorKind::Configuration { key } => json!({ "configKey": key }),
        };
        match details {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// HTTP status of an `Api` failure; `0` means the request never got a response.
    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            ErrorKind::Api { status_code, .. } => Some(status_code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Text returned to the calling model when a tool fails.
    pub fn format_for_display(&self) -> String {
        let mut text = format!("Error [{}]: {}", self.code(), self.message());
        match &self.kind {
            ErrorKind::Api { response_text, .. } if !response_text.trim().is_empty() => {
                text.push_str("\nResponse: ");
                text.push_str(&excerpt(response_text, DISPLAY_EXCERPT_CHARS));
            }
            ErrorKind::Validation { value, .. } => {
                text.push_str(&format!("\nReceived: {}", value));
            }
            _ => {}
        }
        text
    }
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, MetabaseError>;
