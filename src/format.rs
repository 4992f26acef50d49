// src/format.rs
//
// Renders raw Metabase JSON into compact text for tool results.

use serde_json::Value;

/// Extra columns shown next to `id` and `name` in a resource listing.
pub type ListColumns<'a> = &'a [&'a str];

/// Metabase list endpoints return either a bare array or `{ "data": [...] }`.
pub fn list_items(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

pub fn format_list(title: &str, value: &Value, columns: ListColumns<'_>) -> String {
    let items = list_items(value);
    if items.is_empty() {
        return format!("No {} found.", title.to_lowercase());
    }

    let mut out = format!("{} ({}):\n", title, items.len());
    for item in items {
        out.push_str(&format!(
            "- [{}] {}",
            scalar(item.get("id")),
            item_label(item)
        ));
        let extras: Vec<String> = columns
            .iter()
            .filter_map(|column| {
                item.get(*column)
                    .filter(|v| !v.is_null())
                    .map(|v| format!("{}: {}", column, scalar(Some(v))))
            })
            .collect();
        if !extras.is_empty() {
            out.push_str(&format!(" ({})", extras.join(", ")));
        }
        out.push('\n');
    }
    out
}

pub fn format_entity(kind: &str, value: &Value) -> String {
    let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    match value.get("id") {
        Some(id) => format!("{} {} - {}\n\n{}", kind, scalar(Some(id)), item_label(value), pretty),
        None => format!("{}\n\n{}", kind, pretty),
    }
}

/// Render a `/api/dataset` response as a pipe-separated table.
pub fn format_query_result(value: &Value, max_rows: usize) -> String {
    if value.get("status").and_then(Value::as_str) == Some("failed") {
        let message = value
            .get("error")
            .map(|e| scalar(Some(e)))
            .unwrap_or_else(|| "unknown error".to_string());
        return format!("Query failed: {}", message);
    }

    let data = value.get("data");
    let columns: Vec<String> = data
        .and_then(|d| d.get("cols"))
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .map(|col| {
                    col.get("display_name")
                        .or_else(|| col.get("name"))
                        .map(|name| scalar(Some(name)))
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();
    let rows: &[Value] = data
        .and_then(|d| d.get("rows"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let total = value
        .get("row_count")
        .and_then(Value::as_u64)
        .unwrap_or(rows.len() as u64);

    if rows.is_empty() {
        return "Query returned no rows.".to_string();
    }

    let mut out = String::new();
    if !columns.is_empty() {
        out.push_str(&columns.join(" | "));
        out.push('\n');
        out.push_str(&vec!["---"; columns.len()].join(" | "));
        out.push('\n');
    }
    for row in rows.iter().take(max_rows) {
        let cells: Vec<String> = match row {
            Value::Array(cells) => cells.iter().map(|c| scalar(Some(c))).collect(),
            other => vec![scalar(Some(other))],
        };
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    let shown = rows.len().min(max_rows);
    out.push_str(&format!("\nShowing {} of {} rows.", shown, total));
    out
}

fn item_label(item: &Value) -> String {
    item.get("name")
        .or_else(|| item.get("common_name"))
        .or_else(|| item.get("email"))
        .map(|v| scalar(Some(v)))
        .unwrap_or_else(|| "(unnamed)".to_string())
}

fn scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
