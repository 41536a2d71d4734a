//! Gold-standard evaluation sets (CSV or JSONL).

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::{Map, Value};

use crate::classifier::Label;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Dataset not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Missing required columns in dataset: {missing:?}\nFound columns: {found:?}")]
    MissingColumns { missing: Vec<String>, found: Vec<String> },
    #[error("Invalid JSON at line {line} in {path:?}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One labelled report.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub gold: String,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub path: PathBuf,
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Loads a dataset for the label type `L`. The gold column is
    /// `L::DATASET_GOLD_COLUMN`; `.jsonl` files are read line by line,
    /// everything else as CSV with a header row.
    pub fn load<L: Label, P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DatasetError::NotFound(path.to_path_buf()));
        }

        let required = required_columns::<L>();
        let rows = match path.extension().and_then(|ext| ext.to_str()) {
            Some("jsonl") | Some("ndjson") => load_jsonl(path, &required)?,
            _ => load_csv(path, &required)?,
        };

        check_rows::<L>(&rows);
        info!("Loaded {} rows from {:?}", rows.len(), path);
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }
}

fn required_columns<L: Label>() -> [&'static str; 4] {
    ["id", "subject", "description", L::DATASET_GOLD_COLUMN]
}

fn missing_columns(required: &[&str], found: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|column| !found.iter().any(|f| f == *column))
        .map(|column| column.to_string())
        .collect()
}

fn load_csv(path: &Path, required: &[&str; 4]) -> Result<Vec<DatasetRow>, DatasetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let missing = missing_columns(required, &headers);
    if !missing.is_empty() {
        return Err(DatasetError::MissingColumns { missing, found: headers });
    }

    let index: Vec<usize> = required
        .iter()
        .filter_map(|column| headers.iter().position(|h| h == column))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cell = |i: usize| record.get(index[i]).unwrap_or("").to_string();
        rows.push(DatasetRow {
            id: cell(0),
            subject: cell(1),
            description: cell(2),
            gold: cell(3),
        });
    }
    Ok(rows)
}

fn load_jsonl(path: &Path, required: &[&str; 4]) -> Result<Vec<DatasetRow>, DatasetError> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let parse_error = |message: String| DatasetError::Parse {
            path: path.to_path_buf(),
            line: line_number,
            message,
        };
        let value: Value = serde_json::from_str(line.trim()).map_err(|e| parse_error(e.to_string()))?;
        let object = match value {
            Value::Object(object) => object,
            other => return Err(parse_error(format!("expected an object, got {}", other))),
        };

        let found: Vec<String> = object.keys().cloned().collect();
        let missing = missing_columns(required, &found);
        if !missing.is_empty() {
            return Err(DatasetError::MissingColumns { missing, found });
        }

        rows.push(DatasetRow {
            id: field_text(&object, required[0]),
            subject: field_text(&object, required[1]),
            description: field_text(&object, required[2]),
            gold: field_text(&object, required[3]),
        });
    }
    Ok(rows)
}

/// Stringifies scalar JSON values; ids and labels are sometimes numbers or
/// booleans in hand-edited files.
fn field_text(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn check_rows<L: Label>(rows: &[DatasetRow]) {
    let mut seen = HashSet::new();
    for row in rows {
        if !seen.insert(row.id.as_str()) {
            warn!("Duplicate id in dataset: {}", row.id);
        }
    }

    let unknown = rows.iter().filter(|row| L::parse(&row.gold).is_none()).count();
    if unknown > 0 {
        warn!(
            "{} rows have a gold value outside the {} vocabulary",
            unknown,
            L::TASK
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{IssueCategory, RelevanceLabel};
    use std::fs;

    #[test]
    fn test_load_csv() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gold.csv");
        fs::write(
            &path,
            "id,subject,description,gold_label,notes\n\
             A1,Radweg,\"Scherben, viele\",true,x\n\
             A2,Laterne,Defekt,false,\n",
        )?;

        let dataset = Dataset::load::<RelevanceLabel, _>(&path)?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.rows[0].description, "Scherben, viele");
        assert_eq!(dataset.rows[1].gold, "false");
        Ok(())
    }

    #[test]
    fn test_missing_csv_columns_names_both_sides() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gold.csv");
        fs::write(&path, "id,subject,text\nA1,Radweg,Scherben\n")?;

        match Dataset::load::<RelevanceLabel, _>(&path) {
            Err(DatasetError::MissingColumns { missing, found }) => {
                assert_eq!(missing, vec!["description", "gold_label"]);
                assert_eq!(found, vec!["id", "subject", "text"]);
            }
            other => panic!("expected MissingColumns, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_load_jsonl_category() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("phase2-eval-set.jsonl");
        fs::write(
            &path,
            "{\"id\": 17, \"subject\": \"Straße\", \"description\": \"Schlagloch\", \"phase2_label\": \"Oberflächenqualität / Schäden\"}\n\
             \n\
             {\"id\": \"18\", \"subject\": \"Straße\", \"description\": null, \"phase2_label\": \"Other / Unklar\"}\n",
        )?;

        let dataset = Dataset::load::<IssueCategory, _>(&path)?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.rows[0].id, "17");
        assert_eq!(dataset.rows[1].description, "");
        Ok(())
    }

    #[test]
    fn test_malformed_jsonl_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jsonl");
        fs::write(
            &path,
            "{\"id\": \"1\", \"subject\": \"s\", \"description\": \"d\", \"phase2_label\": \"Other / Unklar\"}\n{not json\n",
        )?;

        match Dataset::load::<IssueCategory, _>(&path) {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected Parse error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = Dataset::load::<RelevanceLabel, _>("/nonexistent/gold.csv").unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }
}
