use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};

use crate::classifier::{Decision, IssueCategory, Label, RelevanceLabel};

/// One row of the remote `events` table, as far as classification needs it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventRow {
    #[serde(deserialize_with = "string_or_number")]
    pub service_request_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub subcategory2: Option<String>,
}

impl EventRow {
    /// Trimmed description, `None` when absent or blank.
    pub fn description_text(&self) -> Option<&str> {
        self.description
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

/// An ordered list of column updates for one row.
pub type Payload = Vec<(&'static str, Value)>;

pub fn payload_to_map(payload: &Payload) -> Map<String, Value> {
    payload
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

/// How a task's decisions map onto the remote `events` table.
pub trait WriteBack: Label {
    /// Columns fetched for classification.
    const SELECT: &'static str;
    const DEFAULT_BATCH_SIZE: usize;

    /// PostgREST filters applied to every fetch.
    fn base_filters() -> Vec<(String, String)>;

    /// Filter selecting rows that have not been classified yet.
    fn unclassified_filter() -> (String, String);

    fn subject(row: &EventRow) -> String;

    /// Columns written back for one decision.
    fn payload(decision: &Decision<Self>) -> Payload;
}

impl WriteBack for RelevanceLabel {
    const SELECT: &'static str = "service_request_id,title,description,service_name";
    const DEFAULT_BATCH_SIZE: usize = 500;

    fn base_filters() -> Vec<(String, String)> {
        Vec::new()
    }

    fn unclassified_filter() -> (String, String) {
        ("bike_related".to_string(), "is.null".to_string())
    }

    fn subject(row: &EventRow) -> String {
        row.title.clone().unwrap_or_default()
    }

    fn payload(decision: &Decision<Self>) -> Payload {
        let bike_related = match decision.label {
            RelevanceLabel::True => Value::Bool(true),
            RelevanceLabel::False => Value::Bool(false),
            RelevanceLabel::Uncertain => Value::Null,
        };
        vec![
            ("bike_related", bike_related),
            ("bike_confidence", json!(decision.confidence)),
            ("bike_evidence", json!(decision.evidence)),
            ("bike_reasoning", json!(decision.reasoning)),
        ]
    }
}

impl WriteBack for IssueCategory {
    const SELECT: &'static str = "service_request_id,category,subcategory,subcategory2,description";
    const DEFAULT_BATCH_SIZE: usize = 100;

    fn base_filters() -> Vec<(String, String)> {
        vec![("bike_related".to_string(), "eq.true".to_string())]
    }

    fn unclassified_filter() -> (String, String) {
        ("bike_issue_category".to_string(), "is.null".to_string())
    }

    /// `category - subcategory - subcategory2`, skipping empty and `NULL`
    /// parts.
    fn subject(row: &EventRow) -> String {
        [&row.category, &row.subcategory, &row.subcategory2]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .map(str::trim)
            .filter(|part| !part.is_empty() && !part.eq_ignore_ascii_case("null"))
            .collect::<Vec<_>>()
            .join(" - ")
    }

    fn payload(decision: &Decision<Self>) -> Payload {
        vec![
            ("bike_issue_category", json!(decision.label.as_str())),
            ("bike_issue_confidence", json!(decision.confidence)),
            ("bike_issue_evidence", json!(decision.evidence)),
            ("bike_issue_reasoning", json!(decision.reasoning)),
        ]
    }
}

/// Payload marking a prefiltered row as not bike related.
pub fn prefilter_payload(reason: &str) -> Payload {
    vec![
        ("bike_related", Value::Bool(false)),
        ("bike_confidence", json!(1.0)),
        ("bike_evidence", json!([])),
        ("bike_reasoning", json!(format!("prefilter: {}", reason))),
    ]
}
