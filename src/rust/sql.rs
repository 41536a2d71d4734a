//! `UPDATE` statements for applying a predictions file by hand.

use std::fmt::Write as _;

use chrono::Local;
use serde_json::Value;

use crate::records::PredictionRecord;
use crate::remote::WriteBack;

/// Renders a JSON value as a SQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) if items.is_empty() => "ARRAY[]::text[]".to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(sql_literal).collect();
            format!("ARRAY[{}]", items.join(", "))
        }
        Value::Object(_) => quote(&value.to_string()),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// One statement per prediction, using the same columns as the remote
/// write-back.
pub fn generate_update_sql<L: WriteBack>(predictions: &[PredictionRecord<L>]) -> String {
    let mut sql = String::new();
    writeln!(sql, "-- Bike Classification Results Update ({})", L::TASK).ok();
    writeln!(sql, "-- Generated: {}", Local::now().to_rfc3339()).ok();
    writeln!(sql, "-- Total predictions: {}", predictions.len()).ok();

    for record in predictions {
        let assignments: Vec<String> = L::payload(&record.pred)
            .iter()
            .map(|(column, value)| format!("    {} = {}", column, sql_literal(value)))
            .collect();
        write!(
            sql,
            "\nUPDATE events SET\n{}\nWHERE service_request_id = {};\n",
            assignments.join(",\n"),
            quote(&record.id)
        )
        .ok();
    }
    sql
}

/// Predicted value counts in vocabulary order.
pub fn label_distribution<L: WriteBack>(predictions: &[PredictionRecord<L>]) -> Vec<(&'static str, usize)> {
    L::ALL
        .iter()
        .map(|label| {
            let count = predictions.iter().filter(|p| p.pred.label == *label).count();
            (label.as_str(), count)
        })
        .collect()
}
