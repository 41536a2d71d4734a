use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{json, Map, Value};

use super::error::{ValidationError, Violation};
use super::labels::Label;

/// Maximum number of evidence snippets in one decision.
pub const MAX_EVIDENCE_ITEMS: usize = 10;
/// Evidence snippets longer than this are truncated, never rejected.
pub const MAX_EVIDENCE_CHARS: usize = 200;
/// Hard limit for the reasoning sentence.
pub const MAX_REASONING_CHARS: usize = 500;

const ELLIPSIS: &str = "...";

/// A validated classification decision.
///
/// Values of this type only come out of [`validate`], so holding one means
/// every field constraint was checked. Serialised field names follow the
/// task: `label` for relevance, `category` for issue categories.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<L: Label> {
    pub label: L,
    pub evidence: Vec<String>,
    pub reasoning: String,
    pub confidence: f64,
}

/// Validates an untyped payload against the decision contract.
///
/// All violated constraints are reported together. Over-length evidence
/// items are shortened to 197 characters plus `...`; every other violation
/// (including a reasoning longer than 500 characters) rejects the payload.
pub fn validate<L: Label>(payload: &Value) -> Result<Decision<L>, ValidationError> {
    let object = match payload.as_object() {
        Some(object) => object,
        None => {
            return Err(ValidationError::single(Violation::new(
                "<root>",
                "expected a JSON object",
                describe(payload),
            )))
        }
    };

    let mut violations = Vec::new();
    let label = validate_label::<L>(object, &mut violations);
    let evidence = validate_evidence(object, &mut violations);
    let reasoning = validate_reasoning(object, &mut violations);
    let confidence = validate_confidence(object, &mut violations);

    match (label, evidence, reasoning, confidence) {
        (Some(label), Some(evidence), Some(reasoning), Some(confidence)) if violations.is_empty() => {
            Ok(Decision { label, evidence, reasoning, confidence })
        }
        _ => Err(ValidationError::new(violations)),
    }
}

fn validate_label<L: Label>(object: &Map<String, Value>, violations: &mut Vec<Violation>) -> Option<L> {
    let value = required(object, L::FIELD, violations)?;
    let Some(text) = value.as_str() else {
        violations.push(Violation::new(L::FIELD, "expected a string", describe(value)));
        return None;
    };
    let parsed = L::parse(text);
    if parsed.is_none() {
        violations.push(Violation::new(
            L::FIELD,
            format!("must be exactly one of {}", quoted_vocabulary::<L>()),
            describe(value),
        ));
    }
    parsed
}

fn validate_evidence(object: &Map<String, Value>, violations: &mut Vec<Violation>) -> Option<Vec<String>> {
    let value = required(object, "evidence", violations)?;
    let Some(items) = value.as_array() else {
        violations.push(Violation::new("evidence", "expected an array of strings", describe(value)));
        return None;
    };
    if items.len() > MAX_EVIDENCE_ITEMS {
        violations.push(Violation::new(
            "evidence",
            format!("at most {} items", MAX_EVIDENCE_ITEMS),
            format!("{} items", items.len()),
        ));
        return None;
    }

    let mut evidence = Vec::with_capacity(items.len());
    let mut valid = true;
    for (index, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(text) => evidence.push(truncate_evidence(text)),
            None => {
                valid = false;
                violations.push(Violation::new(
                    format!("evidence[{}]", index),
                    "expected a string",
                    describe(item),
                ));
            }
        }
    }
    valid.then_some(evidence)
}

fn validate_reasoning(object: &Map<String, Value>, violations: &mut Vec<Violation>) -> Option<String> {
    let value = required(object, "reasoning", violations)?;
    let Some(text) = value.as_str() else {
        violations.push(Violation::new("reasoning", "expected a string", describe(value)));
        return None;
    };
    let length = text.chars().count();
    if length > MAX_REASONING_CHARS {
        violations.push(Violation::new(
            "reasoning",
            format!("at most {} characters", MAX_REASONING_CHARS),
            format!("{} characters", length),
        ));
        return None;
    }
    Some(text.to_string())
}

fn validate_confidence(object: &Map<String, Value>, violations: &mut Vec<Violation>) -> Option<f64> {
    let value = required(object, "confidence", violations)?;
    let Some(confidence) = value.as_f64() else {
        violations.push(Violation::new("confidence", "expected a number", describe(value)));
        return None;
    };
    if !(0.0..=1.0).contains(&confidence) {
        violations.push(Violation::new(
            "confidence",
            "must be between 0.0 and 1.0 inclusive",
            confidence.to_string(),
        ));
        return None;
    }
    Some(confidence)
}

fn required<'a>(
    object: &'a Map<String, Value>,
    field: &str,
    violations: &mut Vec<Violation>,
) -> Option<&'a Value> {
    let value = object.get(field);
    if value.is_none() {
        violations.push(Violation::new(field, "field required", "missing"));
    }
    value
}

/// Shortens an evidence snippet to at most 200 characters.
pub fn truncate_evidence(item: &str) -> String {
    if item.chars().count() <= MAX_EVIDENCE_CHARS {
        return item.to_string();
    }
    let mut truncated: String = item
        .chars()
        .take(MAX_EVIDENCE_CHARS - ELLIPSIS.len())
        .collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

fn describe(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 80 {
        let head: String = rendered.chars().take(77).collect();
        format!("{}...", head)
    } else {
        rendered
    }
}

fn quoted_vocabulary<L: Label>() -> String {
    L::vocabulary()
        .iter()
        .map(|value| format!("'{}'", value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// JSON schema handed to the generation endpoint as the output contract.
pub fn response_schema<L: Label>() -> Value {
    let mut properties = Map::new();
    properties.insert(
        L::FIELD.to_string(),
        json!({
            "type": "string",
            "enum": L::vocabulary(),
        }),
    );
    properties.insert(
        "evidence".to_string(),
        json!({
            "type": "array",
            "items": { "type": "string", "maxLength": MAX_EVIDENCE_CHARS },
            "minItems": 0,
            "maxItems": MAX_EVIDENCE_ITEMS,
        }),
    );
    properties.insert(
        "reasoning".to_string(),
        json!({ "type": "string", "maxLength": MAX_REASONING_CHARS }),
    );
    properties.insert(
        "confidence".to_string(),
        json!({ "type": "number", "minimum": 0.0, "maximum": 1.0 }),
    );

    json!({
        "type": "object",
        "properties": properties,
        "required": [L::FIELD, "evidence", "reasoning", "confidence"],
    })
}

/// Literal restatement of the field constraints, appended to a prompt when
/// the first response did not validate.
pub fn repair_instructions<L: Label>() -> String {
    format!(
        "IMPORTANT: The previous response had validation errors. \
         Please ensure your JSON response EXACTLY matches the required schema:\n\
         - {field}: must be exactly one of {values} (case-sensitive)\n\
         - evidence: array of strings (max {max_items} items, each under {max_evidence} characters)\n\
         - reasoning: single sentence string (max {max_reasoning} characters)\n\
         - confidence: number between 0.0 and 1.0 (inclusive)\n\n\
         Provide ONLY the JSON object, no additional text.",
        field = L::FIELD,
        values = quoted_vocabulary::<L>(),
        max_items = MAX_EVIDENCE_ITEMS,
        max_evidence = MAX_EVIDENCE_CHARS,
        max_reasoning = MAX_REASONING_CHARS,
    )
}

impl<L: Label> Serialize for Decision<L> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Decision", 4)?;
        state.serialize_field(L::FIELD, self.label.as_str())?;
        state.serialize_field("evidence", &self.evidence)?;
        state.serialize_field("reasoning", &self.reasoning)?;
        state.serialize_field("confidence", &self.confidence)?;
        state.end()
    }
}

impl<'de, L: Label> Deserialize<'de> for Decision<L> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        validate(&value).map_err(de::Error::custom)
    }
}
