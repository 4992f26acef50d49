// src/link.rs
//
// Decoding of the base64 fragment Metabase appends to ad-hoc question links
// (`https://host/question#eyJkYXRhc2V0X3F1ZXJ5Ijp7...`).

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MetabaseError, Result};

// The web client writes fragments with or without `=` padding, in either alphabet.
const LENIENT_PADDING: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT_PADDING);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT_PADDING);

/// Structured-builder keys copied out of `dataset_query.query`.
const PARAMETER_KEYS: [(&str, ParameterField); 6] = [
    ("filter", ParameterField::Filters),
    ("aggregation", ParameterField::Aggregations),
    ("breakout", ParameterField::Breakouts),
    ("source-table", ParameterField::SourceTable),
    ("order-by", ParameterField::OrderBy),
    ("limit", ParameterField::Limit),
];

#[derive(Clone, Copy)]
enum ParameterField {
    Filters,
    Aggregations,
    Breakouts,
    SourceTable,
    OrderBy,
    Limit,
}

/// Query-builder clauses lifted from a structured dataset query.
/// Values are copied verbatim; a clause absent from the source stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakouts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_table: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
}

impl LinkParameters {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn slot(&mut self, field: ParameterField) -> &mut Option<Value> {
        match field {
            ParameterField::Filters => &mut self.filters,
            ParameterField::Aggregations => &mut self.aggregations,
            ParameterField::Breakouts => &mut self.breakouts,
            ParameterField::SourceTable => &mut self.source_table,
            ParameterField::OrderBy => &mut self.order_by,
            ParameterField::Limit => &mut self.limit,
        }
    }
}

/// The only top-level fields of a link document the decoder reads.
/// Anything typed as `Value` is passed through untouched.
#[derive(Debug, Deserialize)]
struct LinkDocument {
    #[serde(default)]
    original_card_id: Option<Value>,
    #[serde(default)]
    dataset_query: Option<Value>,
    #[serde(default)]
    display: Option<Value>,
    #[serde(default)]
    visualization_settings: Option<Value>,
    #[serde(default)]
    name: Option<Value>,
    #[serde(default)]
    description: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedLink {
    pub original_card_id: Option<i64>,
    pub dataset_query: Option<Value>,
    pub parameters: LinkParameters,
    pub display: Option<String>,
    pub visualization_settings: Option<Value>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl DecodedLink {
    /// The dataset query's `type` discriminator (`"native"` or `"query"`), if any.
    pub fn query_type(&self) -> Option<&str> {
        self.dataset_query
            .as_ref()
            .and_then(|query| query.get("type"))
            .and_then(Value::as_str)
    }
}

/// Decode a shareable link into its embedded question definition.
///
/// Every failure (missing fragment, bad base64, non-UTF-8 bytes, invalid JSON)
/// is reported as a validation error on the `url` field carrying the original input.
pub fn decode_dashboard_url(url: &str) -> Result<DecodedLink> {
    let document = decode_document(url).map_err(|reason| {
        tracing::debug!("Failed to decode link: {}", reason);
        MetabaseError::validation("url", url, reason)
    })?;
    Ok(map_document(document))
}

fn decode_document(url: &str) -> std::result::Result<LinkDocument, String> {
    if url.is_empty() {
        return Err("URL must be a non-empty string".to_string());
    }

    let fragment = match url.split_once('#') {
        Some((_, fragment)) if !fragment.is_empty() => fragment,
        _ => return Err("No fragment found in URL".to_string()),
    };

    let bytes = STANDARD_LENIENT
        .decode(fragment)
        .or_else(|standard_err| URL_SAFE_LENIENT.decode(fragment).map_err(|_| standard_err))
        .map_err(|e| format!("Failed to decode URL fragment as base64: {}", e))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| format!("Decoded URL fragment is not valid UTF-8: {}", e))?;

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| format!("Decoded URL fragment is not valid JSON: {}", e))?;

    match value {
        Value::Object(map) => {
            serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())
        }
        other => Err(format!(
            "Decoded URL fragment is JSON {} rather than an object",
            json_type_name(&other)
        )),
    }
}

fn map_document(document: LinkDocument) -> DecodedLink {
    let parameters = extract_parameters(document.dataset_query.as_ref());
    DecodedLink {
        original_card_id: document.original_card_id.as_ref().and_then(Value::as_i64),
        dataset_query: document.dataset_query,
        parameters,
        display: into_string(document.display),
        visualization_settings: document.visualization_settings,
        name: into_string(document.name),
        description: into_string(document.description),
    }
}

/// Lift the query-builder clauses out of a `"query"`-type dataset query.
/// Native queries, missing queries and unexpected shapes all yield no parameters.
pub fn extract_parameters(dataset_query: Option<&Value>) -> LinkParameters {
    let mut parameters = LinkParameters::default();

    let body: Option<&Map<String, Value>> = dataset_query
        .filter(|query| query.get("type").and_then(Value::as_str) == Some("query"))
        .and_then(|query| query.get("query"))
        .and_then(Value::as_object);

    if let Some(body) = body {
        for (source_key, field) in PARAMETER_KEYS {
            if let Some(value) = body.get(source_key) {
                *parameters.slot(field) = Some(value.clone());
            }
        }
    }

    parameters
}

fn into_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
    use serde_json::json;

    fn link_for(document: &Value) -> String {
        format!(
            "https://metabase.example.com/question#{}",
            STANDARD.encode(document.to_string())
        )
    }

    fn assert_url_validation_error(input: &str) {
        let err = decode_dashboard_url(input).expect_err("decode must fail");
        match err.kind() {
            ErrorKind::Validation { field, value, .. } => {
                assert_eq!(field, "url");
                assert_eq!(value, &json!(input));
            }
            other => panic!("Expected validation error, got: {:?}", other),
        }
    }

    #[test]
    fn decodes_structured_query_link() {
        let url = link_for(&json!({
            "original_card_id": 42,
            "dataset_query": {
                "type": "query",
                "query": {"filter": ["=", ["field", "X", null]], "limit": 10}
            },
            "display": "table"
        }));

        let decoded = decode_dashboard_url(&url).expect("link must decode");

        assert_eq!(decoded.original_card_id, Some(42));
        assert_eq!(decoded.display.as_deref(), Some("table"));
        assert_eq!(decoded.query_type(), Some("query"));
        assert_eq!(
            decoded.parameters,
            LinkParameters {
                filters: Some(json!(["=", ["field", "X", null]])),
                limit: Some(json!(10)),
                ..Default::default()
            }
        );
        assert_eq!(decoded.name, None);
        assert_eq!(decoded.visualization_settings, None);
    }

    #[test]
    fn renames_every_builder_clause() {
        let dataset_query = json!({
            "type": "query",
            "database": 1,
            "query": {
                "source-table": 7,
                "filter": ["and"],
                "aggregation": [["count"]],
                "breakout": [["field", 3, null]],
                "order-by": [["asc", ["field", 3, null]]],
                "limit": 5,
                "fields": [["field", 9, null]]
            }
        });

        let parameters = extract_parameters(Some(&dataset_query));

        assert_eq!(
            serde_json::to_value(&parameters).expect("parameters serialize"),
            json!({
                "filters": ["and"],
                "aggregations": [["count"]],
                "breakouts": [["field", 3, null]],
                "sourceTable": 7,
                "orderBy": [["asc", ["field", 3, null]]],
                "limit": 5
            })
        );
    }

    #[test]
    fn native_and_missing_queries_have_no_parameters() {
        let native = json!({"type": "native", "native": {"query": "SELECT 1", "limit": 3}});
        assert!(extract_parameters(Some(&native)).is_empty());
        assert!(extract_parameters(None).is_empty());
        assert!(extract_parameters(Some(&json!({"type": "query", "query": "oops"}))).is_empty());
        assert!(extract_parameters(Some(&json!("query"))).is_empty());

        let url = link_for(&json!({"original_card_id": 5, "display": "pie"}));
        let decoded = decode_dashboard_url(&url).expect("link must decode");
        assert!(decoded.parameters.is_empty());
        assert_eq!(
            serde_json::to_value(&decoded.parameters).expect("parameters serialize"),
            json!({})
        );
    }

    #[test]
    fn passes_visualization_fields_through() {
        let url = link_for(&json!({
            "original_card_id": 8,
            "dataset_query": {"type": "native", "native": {"query": "SELECT 1"}},
            "display": "pie",
            "visualization_settings": {"pie.show_legend": true},
            "name": "Orders by state",
            "description": null
        }));

        let decoded = decode_dashboard_url(&url).expect("link must decode");

        assert_eq!(decoded.query_type(), Some("native"));
        assert_eq!(
            decoded.visualization_settings,
            Some(json!({"pie.show_legend": true}))
        );
        assert_eq!(decoded.name.as_deref(), Some("Orders by state"));
        assert_eq!(decoded.description, None);
    }

    #[test]
    fn rejects_input_without_fragment() {
        assert_url_validation_error("no-hash-here");
        assert_url_validation_error("");
        assert_url_validation_error("https://metabase.example.com/question#");
    }

    #[test]
    fn accepts_unpadded_fragment() {
        // 41 bytes of JSON, so the padded form would end in '='
        let document = r#"{"original_card_id":42,"display":"table"}"#;
        assert!(STANDARD.encode(document).ends_with('='));

        let url = format!("https://host/question#{}", STANDARD_NO_PAD.encode(document));
        let decoded = decode_dashboard_url(&url).expect("unpadded link must decode");
        assert_eq!(decoded.original_card_id, Some(42));
        assert_eq!(decoded.display.as_deref(), Some("table"));
    }

    #[test]
    fn accepts_url_safe_alphabet() {
        // A run of '?' bytes always encodes to '/' in the standard alphabet, '_' in the URL-safe one
        let document = json!({"original_card_id": 9, "name": "??????", "display": "bar"}).to_string();
        let fragment = URL_SAFE_NO_PAD.encode(&document);
        assert!(fragment.contains('_'));

        let url = format!("https://host/question#{}", fragment);
        let decoded = decode_dashboard_url(&url).expect("url-safe link must decode");
        assert_eq!(decoded.original_card_id, Some(9));
        assert_eq!(decoded.name.as_deref(), Some("??????"));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_url_validation_error("https://metabase.example.com/question#%%%not-base64%%%");
    }

    #[test]
    fn rejects_base64_that_is_not_json() {
        let url = format!("https://host/question#{}", STANDARD.encode("not json at all"));
        assert_url_validation_error(&url);

        let url = format!("https://host/question#{}", STANDARD.encode("[1, 2, 3]"));
        assert_url_validation_error(&url);
    }

    #[test]
    fn decoding_is_deterministic() {
        let url = link_for(&json!({
            "original_card_id": 3,
            "dataset_query": {"type": "query", "query": {"breakout": [["field", 1, null]]}}
        }));
        let first = decode_dashboard_url(&url).expect("link must decode");
        let second = decode_dashboard_url(&url).expect("link must decode");
        assert_eq!(first, second);
    }
}
