//! Run directories and their append-only JSON artifacts.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::classifier::Label;
use crate::metrics::Metrics;
use crate::records::{PredictionRecord, RunConfig};

pub const PREDICTIONS_FILE: &str = "predictions.jsonl";
pub const ERRORS_FILE: &str = "errors.jsonl";
pub const METRICS_FILE: &str = "metrics.json";
pub const CONFIG_FILE: &str = "config.json";
pub const REPORT_FILE: &str = "misclassifications.md";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

const GIT_COMMIT_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Invalid JSON at line {line} in {path:?}: {message}")]
    InvalidLine {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Directory name for a new run: `{YYYYmmdd_HHMMSS}_{prompt}[_{model}]`.
pub fn run_dir_name(timestamp: DateTime<Local>, prompt_version: &str, model_short: Option<&str>) -> String {
    let stamp = timestamp.format("%Y%m%d_%H%M%S");
    match model_short {
        Some(model) => format!("{}_{}_{}", stamp, prompt_version, model),
        None => format!("{}_{}", stamp, prompt_version),
    }
}

/// Creates a fresh directory under `runs_root`, never reusing an existing
/// one. On a name collision `_2`, `_3`, ... is appended.
pub fn create_run_dir(runs_root: &Path, name: &str) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(runs_root)?;

    let mut candidate = runs_root.join(name);
    let mut suffix = 2;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                candidate = runs_root.join(format!("{}_{}", name, suffix));
                suffix += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// One JSON object per line, appended as records are produced. The file is
/// created on the first append, so an empty log leaves no file behind.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
    written: usize,
}

impl JsonlLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), ArtifactError> {
        let mut line = serde_json::to_string(record).map_err(|source| ArtifactError::Json {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        self.written += 1;
        Ok(())
    }
}

/// Pretty-printed JSON with a trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    text.push('\n');
    fs::write(path, text)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads every non-blank line; any malformed line fails the whole read.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }

    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line.trim()).map_err(|e| ArtifactError::InvalidLine {
            path: path.to_path_buf(),
            line: index + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Accepts either a run directory or a predictions file.
pub fn predictions_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(PREDICTIONS_FILE)
    } else {
        path.to_path_buf()
    }
}

pub fn read_predictions<L: Label>(path: &Path) -> Result<Vec<PredictionRecord<L>>, ArtifactError> {
    read_jsonl(&predictions_path(path))
}

pub fn read_config(run_dir: &Path) -> Result<RunConfig, ArtifactError> {
    read_json(&run_dir.join(CONFIG_FILE))
}

/// `None` when the run produced no metrics (zero successful predictions).
pub fn read_metrics(run_dir: &Path) -> Result<Option<Metrics>, ArtifactError> {
    let path = run_dir.join(METRICS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Short hash of the checked-out revision, or `unknown` outside a git tree.
pub fn git_commit(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if hash.is_empty() {
                "unknown".to_string()
            } else {
                hash.chars().take(GIT_COMMIT_LEN).collect()
            }
        }
        _ => "unknown".to_string(),
    }
}
