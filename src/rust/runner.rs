//! Drives one evaluation pass over a gold dataset.
//!
//! A run moves through `Initializing → Processing → Aggregating →
//! Persisted`. Rows are classified strictly in dataset order, one at a time,
//! and every row ends up as exactly one prediction or one error record.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, Utc};
use log::{error, info, warn};

use crate::artifacts::{self, ArtifactError, JsonlLog};
use crate::classifier::{Classifier, Label};
use crate::config::ModelInfo;
use crate::dataset::Dataset;
use crate::metrics::{compute_metrics, MetricsError};
use crate::prompts::{format_prompt, LoadedPrompt};
use crate::records::{ErrorRecord, PredictionMeta, PredictionRecord, RunArtifacts, RunConfig};
use crate::report::{self, ReportError};
use crate::telemetry::{NoopSink, TraceEvent, TraceSink};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Runner is missing {0}")]
    MissingComponent(&'static str),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Initializing,
    Processing,
    Aggregating,
    Persisted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Initializing => "initializing",
            RunPhase::Processing => "processing",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Sampling parameters shared by every row of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub model: &'static ModelInfo,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

pub struct EvaluationRunner<L: Label> {
    classifier: Classifier<L>,
    prompt: LoadedPrompt,
    settings: RunSettings,
    tracer: Arc<dyn TraceSink>,
    runs_dir: PathBuf,
    git_commit: String,
    cancel: Arc<AtomicBool>,
}

impl<L: Label> EvaluationRunner<L> {
    pub fn builder() -> EvaluationRunnerBuilder<L> {
        EvaluationRunnerBuilder::new()
    }

    fn enter(&self, phase: RunPhase) {
        info!("Run phase: {}", phase);
    }

    /// Runs the whole dataset (or until cancelled) and persists the bundle.
    ///
    /// Per-row failures are recorded, never returned. The only errors are
    /// artifact I/O failures.
    pub async fn run(&self, dataset: &Dataset) -> Result<RunArtifacts<L>, RunError> {
        self.enter(RunPhase::Initializing);
        let name = artifacts::run_dir_name(
            Local::now(),
            &self.prompt.version,
            Some(self.settings.model.short_name),
        );
        let run_dir = artifacts::create_run_dir(&self.runs_dir, &name)?;
        info!("Run directory: {:?}", run_dir);

        let mut prediction_log = JsonlLog::new(run_dir.join(artifacts::PREDICTIONS_FILE));
        let mut error_log = JsonlLog::new(run_dir.join(artifacts::ERRORS_FILE));
        let mut predictions: Vec<PredictionRecord<L>> = Vec::new();
        let mut errors: Vec<ErrorRecord<L>> = Vec::new();
        let mut processed = 0usize;
        let mut interrupted = false;

        self.enter(RunPhase::Processing);
        let total = dataset.len();
        for (index, row) in dataset.rows.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Interrupted after {} of {} rows", processed, total);
                interrupted = true;
                break;
            }

            let full_prompt = format_prompt(&self.prompt.content, &row.subject, &row.description);
            let started = Utc::now();
            let outcome = self
                .classifier
                .classify_with_retry(
                    &full_prompt,
                    self.settings.model.id,
                    self.settings.temperature,
                    self.settings.max_output_tokens,
                )
                .await;

            self.tracer.record(TraceEvent {
                name: format!("classify_{}", row.id),
                item_id: row.id.clone(),
                model_id: self.settings.model.id.to_string(),
                prompt_version: self.prompt.version.clone(),
                input: full_prompt,
                output: outcome.decision().and_then(|d| serde_json::to_value(d).ok()),
                error: outcome.error().map(|e| e.to_string()),
                attempts: outcome.attempts,
                latency_ms: outcome.elapsed_ms,
                start_time: started,
            });

            match outcome.result {
                Ok(decision) => {
                    info!(
                        "[{}/{}] {} → {} ({} ms, {} attempt(s))",
                        index + 1,
                        total,
                        row.id,
                        decision.label.as_str(),
                        outcome.elapsed_ms,
                        outcome.attempts
                    );
                    let record = PredictionRecord {
                        id: row.id.clone(),
                        subject: row.subject.clone(),
                        description: row.description.clone(),
                        gold: Some(row.gold.clone()),
                        pred: decision,
                        meta: PredictionMeta {
                            model_id: self.settings.model.id.to_string(),
                            prompt_version: self.prompt.version.clone(),
                            prompt_hash: self.prompt.hash.clone(),
                            temperature: self.settings.temperature,
                            max_output_tokens: self.settings.max_output_tokens,
                            timestamp: Utc::now(),
                            latency_ms: outcome.elapsed_ms,
                            attempts: outcome.attempts,
                        },
                    };
                    prediction_log.append(&record)?;
                    predictions.push(record);
                }
                Err(err) => {
                    error!("[{}/{}] Failed: {} - {}", index + 1, total, row.id, err);
                    let record = ErrorRecord::new(
                        row.id.clone(),
                        row.subject.clone(),
                        row.description.clone(),
                        Some(row.gold.clone()),
                        err.to_string(),
                        outcome.attempts,
                    );
                    error_log.append(&record)?;
                    errors.push(record);
                }
            }
            processed += 1;
        }
        debug_assert_eq!(predictions.len() + errors.len(), processed);

        self.enter(RunPhase::Aggregating);
        let metrics = if predictions.is_empty() {
            warn!("No successful predictions to compute metrics");
            None
        } else {
            let gold: Vec<&str> = predictions.iter().filter_map(|p| p.gold.as_deref()).collect();
            let pred: Vec<&str> = predictions.iter().map(|p| p.predicted()).collect();
            let metrics = compute_metrics(&gold, &pred, &L::vocabulary())?;
            info!("Accuracy: {:.3}  Macro F1: {:.3}", metrics.accuracy, metrics.macro_f1);
            Some(metrics)
        };

        if let Some(metrics) = &metrics {
            artifacts::write_json(&run_dir.join(artifacts::METRICS_FILE), metrics)?;
        }
        let config = RunConfig {
            task: L::TASK.to_string(),
            model_id: self.settings.model.id.to_string(),
            model_display_name: self.settings.model.display_name.to_string(),
            prompt_version: self.prompt.version.clone(),
            prompt_hash: self.prompt.hash.clone(),
            temperature: self.settings.temperature,
            max_output_tokens: self.settings.max_output_tokens,
            dataset_path: dataset.path.display().to_string(),
            dataset_rows: total,
            processed_rows: processed,
            successful_predictions: predictions.len(),
            failed_predictions: errors.len(),
            interrupted,
            git_commit: self.git_commit.clone(),
            timestamp: Utc::now(),
        };
        artifacts::write_json(&run_dir.join(artifacts::CONFIG_FILE), &config)?;
        if !predictions.is_empty() {
            let misclassified =
                report::write_misclassification_report(&predictions, &run_dir.join(artifacts::REPORT_FILE))?;
            info!("{} misclassified cases written to {}", misclassified, artifacts::REPORT_FILE);
        }

        self.tracer.flush().await;
        self.enter(RunPhase::Persisted);

        Ok(RunArtifacts {
            run_dir,
            config,
            predictions,
            errors,
            metrics,
        })
    }
}

/// Fluent construction of an [`EvaluationRunner`].
pub struct EvaluationRunnerBuilder<L: Label> {
    classifier: Option<Classifier<L>>,
    prompt: Option<LoadedPrompt>,
    settings: Option<RunSettings>,
    tracer: Option<Arc<dyn TraceSink>>,
    runs_dir: Option<PathBuf>,
    git_commit: Option<String>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<L: Label> Default for EvaluationRunnerBuilder<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Label> EvaluationRunnerBuilder<L> {
    pub fn new() -> Self {
        Self {
            classifier: None,
            prompt: None,
            settings: None,
            tracer: None,
            runs_dir: None,
            git_commit: None,
            cancel: None,
        }
    }

    pub fn classifier(mut self, classifier: Classifier<L>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn prompt(mut self, prompt: LoadedPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Defaults to [`NoopSink`].
    pub fn tracer(mut self, tracer: Arc<dyn TraceSink>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Revision recorded in `config.json`. Looked up from the runs directory
    /// when not set.
    pub fn git_commit(mut self, commit: impl Into<String>) -> Self {
        self.git_commit = Some(commit.into());
        self
    }

    /// Checked between rows; once set, the run stops and persists what it has.
    pub fn cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<EvaluationRunner<L>, RunError> {
        let classifier = self.classifier.ok_or(RunError::MissingComponent("a classifier"))?;
        let prompt = self.prompt.ok_or(RunError::MissingComponent("a prompt"))?;
        let settings = self.settings.ok_or(RunError::MissingComponent("run settings"))?;
        let runs_dir = self.runs_dir.ok_or(RunError::MissingComponent("a runs directory"))?;
        let git_commit = self.git_commit.unwrap_or_else(|| {
            let probe = if runs_dir.exists() { runs_dir.as_path() } else { std::path::Path::new(".") };
            artifacts::git_commit(probe)
        });

        Ok(EvaluationRunner {
            classifier,
            prompt,
            settings,
            tracer: self.tracer.unwrap_or_else(|| Arc::new(NoopSink)),
            runs_dir,
            git_commit,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}
