//! Read-only views over persisted runs: misclassification reports, run
//! diffs and multi-run comparisons.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifacts::{self, ArtifactError};
use crate::classifier::Label;
use crate::metrics::Metrics;
use crate::records::{PredictionRecord, RunConfig};

/// Placeholder for a side of a diff that has no prediction for an id.
pub const MISSING: &str = "MISSING";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Records whose prediction disagrees with their gold value. Records without
/// a gold value are never counted as misclassified.
pub fn misclassified<L: Label>(predictions: &[PredictionRecord<L>]) -> Vec<&PredictionRecord<L>> {
    predictions
        .iter()
        .filter(|record| record.is_correct() == Some(false))
        .collect()
}

/// Counts of each `gold → pred` transition, most frequent first. Ties keep
/// the order in which the transition was first seen.
pub fn error_breakdown<L: Label>(misclassified: &[&PredictionRecord<L>]) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for record in misclassified {
        let key = format!(
            "{} → {}",
            record.gold.as_deref().unwrap_or_default(),
            record.predicted()
        );
        match counts.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, count)) => *count += 1,
            None => counts.push((key, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

/// Renders the markdown misclassification report and returns it with the
/// number of misclassified cases.
pub fn misclassification_report<L: Label>(predictions: &[PredictionRecord<L>]) -> (String, usize) {
    let wrong = misclassified(predictions);
    let total = predictions.len();
    let mut out = String::from("# Misclassification Report\n\n## Summary\n\n");

    if total == 0 {
        out.push_str("⚠️ **No successful predictions.** Nothing to compare against gold labels.\n");
        return (out, 0);
    }

    if wrong.is_empty() {
        out.push_str("✅ **Perfect accuracy!** No misclassifications found.\n\n");
        writeln!(out, "- Total predictions: {}", total).ok();
        out.push_str("- Correct predictions: 100%\n");
        return (out, 0);
    }

    let correct = total - wrong.len();
    writeln!(out, "- **Total predictions**: {}", total).ok();
    writeln!(out, "- **Correct predictions**: {}", correct).ok();
    writeln!(out, "- **Misclassified**: {}", wrong.len()).ok();
    writeln!(out, "- **Accuracy**: {:.1}%\n", correct as f64 / total as f64 * 100.0).ok();

    out.push_str("### Error Breakdown\n\n");
    for (transition, count) in error_breakdown(&wrong) {
        writeln!(out, "- **{}**: {} cases", transition, count).ok();
    }
    out.push_str("\n---\n\n## Misclassified Cases\n\n");

    for (i, record) in wrong.iter().enumerate() {
        let gold = record.gold.as_deref().unwrap_or_default();
        let predicted = record.predicted();
        writeln!(out, "### {}. Case {}\n", i + 1, record.id).ok();
        writeln!(out, "**Gold Label**: {} `{}`  ", L::marker(gold), gold).ok();
        writeln!(out, "**Predicted Label**: {} `{}`  ", L::marker(predicted), predicted).ok();
        writeln!(out, "**Confidence**: {:.2}  ", record.pred.confidence).ok();
        writeln!(out, "**Attempts**: {}  \n", record.meta.attempts).ok();

        writeln!(out, "**Subject:**\n> {}\n", record.subject).ok();
        writeln!(out, "**Description:**\n> {}\n", record.description).ok();
        writeln!(out, "**Model's Reasoning:**\n> {}\n", record.pred.reasoning).ok();

        if record.pred.evidence.is_empty() {
            out.push_str("**Evidence Extracted:** _(None)_\n\n");
        } else {
            out.push_str("**Evidence Extracted:**\n");
            for evidence in &record.pred.evidence {
                writeln!(out, "> - {}", evidence).ok();
            }
            out.push('\n');
        }

        out.push_str("**Metadata:**\n");
        writeln!(out, "- Text length: {} chars", record.description.chars().count()).ok();
        writeln!(out, "- Latency: {} ms", record.meta.latency_ms).ok();
        writeln!(out, "- Model: {}", record.meta.model_id).ok();
        writeln!(out, "- Prompt version: {}\n", record.meta.prompt_version).ok();
        out.push_str("---\n\n");
    }

    (out, wrong.len())
}

pub fn write_misclassification_report<L: Label>(
    predictions: &[PredictionRecord<L>],
    path: &Path,
) -> Result<usize, ReportError> {
    let (content, count) = misclassification_report(predictions);
    fs::write(path, content)?;
    Ok(count)
}

/// One id on which two runs disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub id: String,
    pub gold: String,
    pub run_a: String,
    pub run_b: String,
    pub subject: String,
}

/// Pairs two runs' predictions by id. Ids present in only one run are
/// reported with the other side set to [`MISSING`]. Sorted by id.
pub fn diff_runs<L: Label>(run_a: &[PredictionRecord<L>], run_b: &[PredictionRecord<L>]) -> Vec<DiffEntry> {
    let mut paired: BTreeMap<&str, (Option<&PredictionRecord<L>>, Option<&PredictionRecord<L>>)> = BTreeMap::new();
    for record in run_a {
        paired.entry(record.id.as_str()).or_default().0 = Some(record);
    }
    for record in run_b {
        paired.entry(record.id.as_str()).or_default().1 = Some(record);
    }

    paired
        .into_iter()
        .filter_map(|(id, sides)| {
            let (label_a, label_b, source) = match sides {
                (Some(a), Some(b)) if a.predicted() == b.predicted() => return None,
                (Some(a), Some(b)) => (a.predicted(), b.predicted(), a),
                (Some(a), None) => (a.predicted(), MISSING, a),
                (None, Some(b)) => (MISSING, b.predicted(), b),
                (None, None) => return None,
            };
            Some(DiffEntry {
                id: id.to_string(),
                gold: source.gold.clone().unwrap_or_default(),
                run_a: label_a.to_string(),
                run_b: label_b.to_string(),
                subject: source.subject.clone(),
            })
        })
        .collect()
}

/// Shortens `text` to at most `max` characters, ending in `...` when cut.
pub fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Headline figures of one persisted run.
#[derive(Debug, Clone)]
pub struct RunComparison {
    pub run_dir: PathBuf,
    pub config: Option<RunConfig>,
    pub metrics: Option<Metrics>,
    pub total: usize,
    pub misclassified_ids: Vec<String>,
    /// Predicted value counts in vocabulary order
    pub predicted_distribution: Vec<(&'static str, usize)>,
}

impl RunComparison {
    pub fn name(&self) -> String {
        self.run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.run_dir.display().to_string())
    }
}

pub fn compare_runs<L: Label>(run_dirs: &[PathBuf]) -> Result<Vec<RunComparison>, ReportError> {
    run_dirs
        .iter()
        .map(|run_dir| -> Result<RunComparison, ReportError> {
            let predictions = artifacts::read_predictions::<L>(run_dir)?;
            let config = match artifacts::read_config(run_dir) {
                Ok(config) => Some(config),
                Err(ArtifactError::NotFound(_)) => None,
                Err(err) => return Err(err.into()),
            };
            let metrics = artifacts::read_metrics(run_dir)?;

            let predicted_distribution = L::ALL
                .iter()
                .map(|label| {
                    let count = predictions.iter().filter(|p| p.pred.label == *label).count();
                    (label.as_str(), count)
                })
                .collect();

            Ok(RunComparison {
                run_dir: run_dir.clone(),
                config,
                metrics,
                total: predictions.len(),
                misclassified_ids: misclassified(&predictions).iter().map(|p| p.id.clone()).collect(),
                predicted_distribution,
            })
        })
        .collect()
}

/// Ids misclassified in every compared run.
pub fn persistent_errors(runs: &[RunComparison]) -> Vec<String> {
    let Some((first, rest)) = runs.split_first() else {
        return Vec::new();
    };
    first
        .misclassified_ids
        .iter()
        .filter(|id| rest.iter().all(|run| run.misclassified_ids.contains(id)))
        .cloned()
        .collect()
}
