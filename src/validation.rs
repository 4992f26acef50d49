// src/validation.rs

use serde_json::Value;

use crate::error::{MetabaseError, Result};

pub fn positive_id(field: &str, value: i64) -> Result<i64> {
    if value <= 0 {
        return Err(MetabaseError::validation(
            field,
            value,
            "must be a positive integer",
        ));
    }
    Ok(value)
}

pub fn non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MetabaseError::validation(field, value, "must not be empty"));
    }
    Ok(trimmed)
}

pub fn sql_query(value: &str) -> Result<&str> {
    non_empty("query", value)
}

pub fn row_limit(field: &str, value: u32, max: u32) -> Result<u32> {
    if value == 0 || value > max {
        return Err(MetabaseError::validation(
            field,
            value,
            format!("must be between 1 and {}", max),
        ));
    }
    Ok(value)
}

pub fn json_object<'a>(field: &str, value: &'a Value) -> Result<&'a Value> {
    if !value.is_object() {
        return Err(MetabaseError::validation(
            field,
            value.clone(),
            "must be a JSON object",
        ));
    }
    Ok(value)
}
