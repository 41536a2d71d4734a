//! Fetch → screen → classify → write back, batch by batch, with a
//! resumable checkpoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use super::client::{BatchQuery, EventStore, RemoteError};
use super::prefilter::{should_check_with_llm, PrefilterDecision, SkipReason};
use super::writeback::{payload_to_map, prefilter_payload, EventRow, Payload, WriteBack};
use crate::artifacts::{self, ArtifactError, JsonlLog};
use crate::classifier::{Classifier, IssueCategory, RelevanceLabel};
use crate::prompts::{format_prompt, LoadedPrompt};
use crate::records::{ErrorRecord, PredictionMeta, PredictionRecord};
use crate::runner::RunSettings;
use crate::telemetry::{NoopSink, TraceEvent, TraceSink};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("A checkpoint already exists at {0:?}. Pass --resume to continue it or choose another run name.")]
    CheckpointExists(PathBuf),
    #[error("Classification requires a model; only --prefilter-only runs without one")]
    MissingModel,
}

/// Counters persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStats {
    pub batches: usize,
    pub fetched: usize,
    pub prefiltered: usize,
    pub skipped: usize,
    pub classified: usize,
    pub errors: usize,
    pub updated: usize,
    pub write_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Key of the last fully processed row
    pub last_id: Option<String>,
    #[serde(default)]
    pub stats: PipelineStats,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// A missing file is an empty checkpoint.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        artifacts::read_json(path)
    }

    pub fn save(&mut self, path: &Path) -> Result<(), ArtifactError> {
        self.updated_at = Some(Utc::now());
        artifacts::write_json(path, self)
    }
}

/// Opens the directory of a pipeline run and its checkpoint.
///
/// A named run is reused; without `resume` it must not hold a checkpoint
/// yet. Unnamed runs always get a fresh directory.
pub fn open_run_dir(
    runs_root: &Path,
    run_name: Option<&str>,
    default_name: &str,
    resume: bool,
) -> Result<(PathBuf, Checkpoint), PipelineError> {
    let run_dir = match run_name {
        Some(name) => {
            let dir = runs_root.join(name);
            fs::create_dir_all(&dir).map_err(ArtifactError::from)?;
            dir
        }
        None => artifacts::create_run_dir(runs_root, default_name)?,
    };

    let checkpoint_path = run_dir.join(artifacts::CHECKPOINT_FILE);
    if resume {
        let checkpoint = Checkpoint::load(&checkpoint_path)?;
        match &checkpoint.last_id {
            Some(last_id) => info!("Resuming after {} ({} rows fetched so far)", last_id, checkpoint.stats.fetched),
            None => warn!("No checkpoint found in {:?}, starting from the beginning", run_dir),
        }
        Ok((run_dir, checkpoint))
    } else if checkpoint_path.exists() {
        Err(PipelineError::CheckpointExists(checkpoint_path))
    } else {
        Ok((run_dir, Checkpoint::default()))
    }
}

/// What happens to a fetched row before any model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Classify,
    /// Not classifiable (e.g. no description)
    Skip(String),
    /// Known not to be relevant; may be written back without a model call
    Exclude(String),
}

/// Task-specific screening of fetched rows.
pub trait Screening: WriteBack {
    fn screen(row: &EventRow) -> Screen;

    /// Payload for an excluded row, if the task writes one.
    fn exclusion_payload(reason: &str) -> Option<Payload>;
}

impl Screening for RelevanceLabel {
    fn screen(row: &EventRow) -> Screen {
        let service_name = row.service_name.as_deref().unwrap_or_default();
        match should_check_with_llm(service_name, row.description.as_deref()) {
            PrefilterDecision::Check(_) => Screen::Classify,
            PrefilterDecision::Skip(reason @ SkipReason::NoDescription) => Screen::Skip(reason.to_string()),
            PrefilterDecision::Skip(reason) => Screen::Exclude(reason.to_string()),
        }
    }

    fn exclusion_payload(reason: &str) -> Option<Payload> {
        Some(prefilter_payload(reason))
    }
}

impl Screening for IssueCategory {
    fn screen(row: &EventRow) -> Screen {
        match row.description_text() {
            Some(_) => Screen::Classify,
            None => Screen::Skip("no_description".to_string()),
        }
    }

    fn exclusion_payload(_reason: &str) -> Option<Payload> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    /// Pause after every model call
    pub sleep: Duration,
    /// Stop after this many rows
    pub limit: Option<usize>,
    pub max_batches: Option<usize>,
    pub only_unclassified: bool,
    pub dry_run: bool,
    pub write_prefiltered: bool,
    pub prefilter_only: bool,
}

impl PipelineOptions {
    pub fn for_task<L: WriteBack>() -> Self {
        Self {
            batch_size: L::DEFAULT_BATCH_SIZE,
            sleep: Duration::from_millis(100),
            limit: None,
            max_batches: None,
            only_unclassified: false,
            dry_run: false,
            write_prefiltered: false,
            prefilter_only: false,
        }
    }
}

/// The model side of a pipeline run.
pub struct PipelineModel<L: Screening> {
    pub classifier: Classifier<L>,
    pub prompt: LoadedPrompt,
    pub settings: RunSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub run_dir: PathBuf,
    pub checkpoint: Checkpoint,
    pub interrupted: bool,
}

pub struct RemotePipeline<L: Screening> {
    store: Arc<dyn EventStore>,
    model: Option<PipelineModel<L>>,
    options: PipelineOptions,
    tracer: Arc<dyn TraceSink>,
    cancel: Arc<AtomicBool>,
}

impl<L: Screening> RemotePipeline<L> {
    pub fn new(
        store: Arc<dyn EventStore>,
        model: Option<PipelineModel<L>>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        if model.is_none() && !options.prefilter_only {
            return Err(PipelineError::MissingModel);
        }
        Ok(Self {
            store,
            model,
            options,
            tracer: Arc::new(NoopSink),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TraceSink>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn filters(&self) -> Vec<(String, String)> {
        let mut filters = L::base_filters();
        if self.options.only_unclassified {
            filters.push(L::unclassified_filter());
        }
        filters
    }

    /// Processes batches until the store runs dry, a limit is reached or
    /// the cancel flag is raised. The checkpoint is saved after every batch
    /// and before returning, including on a fatal fetch error.
    pub async fn run(&self, run_dir: &Path, mut checkpoint: Checkpoint) -> Result<PipelineSummary, PipelineError> {
        let checkpoint_path = run_dir.join(artifacts::CHECKPOINT_FILE);
        let mut prediction_log = JsonlLog::new(run_dir.join(artifacts::PREDICTIONS_FILE));
        let mut error_log = JsonlLog::new(run_dir.join(artifacts::ERRORS_FILE));
        let filters = self.filters();
        let mut rows_this_run = 0usize;
        let mut interrupted = false;
        let mut exhausted = false;

        loop {
            if self.cancelled() {
                interrupted = true;
                break;
            }
            if let Some(max) = self.options.max_batches {
                if checkpoint.stats.batches >= max {
                    info!("Reached max batches limit: {}", max);
                    break;
                }
            }
            let remaining = self.options.limit.map(|limit| limit.saturating_sub(rows_this_run));
            if remaining == Some(0) {
                info!("Reached row limit");
                break;
            }

            let limit = remaining.map_or(self.options.batch_size, |r| r.min(self.options.batch_size));
            let query = BatchQuery {
                select: L::SELECT,
                after: checkpoint.last_id.as_deref(),
                limit,
                filters: &filters,
            };
            let batch = match self.store.fetch_batch(&query).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!("Fetch failed, saving checkpoint: {}", err);
                    checkpoint.save(&checkpoint_path)?;
                    return Err(err.into());
                }
            };
            if batch.is_empty() {
                exhausted = true;
                break;
            }

            info!(
                "Fetched batch: {} rows (after {})",
                batch.len(),
                checkpoint.last_id.as_deref().unwrap_or("start")
            );
            checkpoint.stats.batches += 1;
            checkpoint.stats.fetched += batch.len();

            for row in &batch {
                if self.cancelled() {
                    interrupted = true;
                    break;
                }
                if let Err(err) = self
                    .process_row(row, &mut checkpoint, &mut prediction_log, &mut error_log)
                    .await
                {
                    error!("Row {} failed, saving checkpoint: {}", row.service_request_id, err);
                    checkpoint.save(&checkpoint_path)?;
                    return Err(err);
                }
                checkpoint.last_id = Some(row.service_request_id.clone());
                rows_this_run += 1;
                if self.options.limit.is_some_and(|limit| rows_this_run >= limit) {
                    break;
                }
            }

            checkpoint.save(&checkpoint_path)?;
            self.tracer.flush().await;
            if interrupted {
                break;
            }
        }

        if interrupted {
            warn!("Interrupted; checkpoint saved at {:?}", checkpoint.last_id);
        } else {
            if exhausted {
                info!("No more rows to process");
            }
            checkpoint.completed_at = Some(Utc::now());
        }
        checkpoint.save(&checkpoint_path)?;
        self.tracer.flush().await;

        Ok(PipelineSummary {
            run_dir: run_dir.to_path_buf(),
            checkpoint,
            interrupted,
        })
    }

    async fn process_row(
        &self,
        row: &EventRow,
        checkpoint: &mut Checkpoint,
        prediction_log: &mut JsonlLog,
        error_log: &mut JsonlLog,
    ) -> Result<(), PipelineError> {
        let id = row.service_request_id.as_str();
        match L::screen(row) {
            Screen::Skip(reason) => {
                checkpoint.stats.skipped += 1;
                info!("Skipping {}: {}", id, reason);
            }
            Screen::Exclude(reason) => {
                checkpoint.stats.prefiltered += 1;
                if self.options.write_prefiltered || self.options.prefilter_only {
                    if let Some(payload) = L::exclusion_payload(&reason) {
                        self.write_back(id, &payload, checkpoint).await;
                    }
                }
            }
            Screen::Classify if self.options.prefilter_only => {}
            Screen::Classify => {
                let model = self.model.as_ref().ok_or(PipelineError::MissingModel)?;
                self.classify_row(model, row, checkpoint, prediction_log, error_log)
                    .await?;
                if !self.options.sleep.is_zero() {
                    tokio::time::sleep(self.options.sleep).await;
                }
            }
        }
        Ok(())
    }

    async fn classify_row(
        &self,
        model: &PipelineModel<L>,
        row: &EventRow,
        checkpoint: &mut Checkpoint,
        prediction_log: &mut JsonlLog,
        error_log: &mut JsonlLog,
    ) -> Result<(), PipelineError> {
        let id = row.service_request_id.clone();
        let subject = L::subject(row);
        let description = row.description_text().unwrap_or_default().to_string();
        let full_prompt = format_prompt(&model.prompt.content, &subject, &description);

        let started = Utc::now();
        let outcome = model
            .classifier
            .classify_with_retry(
                &full_prompt,
                model.settings.model.id,
                model.settings.temperature,
                model.settings.max_output_tokens,
            )
            .await;

        self.tracer.record(TraceEvent {
            name: format!("pipeline_{}", id),
            item_id: id.clone(),
            model_id: model.settings.model.id.to_string(),
            prompt_version: model.prompt.version.clone(),
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
                    "✓ {}: {} (conf={:.2})",
                    id,
                    decision.label.as_str(),
                    decision.confidence
                );
                let payload = L::payload(&decision);
                let record = PredictionRecord {
                    id: id.clone(),
                    subject,
                    description,
                    gold: None,
                    pred: decision,
                    meta: PredictionMeta {
                        model_id: model.settings.model.id.to_string(),
                        prompt_version: model.prompt.version.clone(),
                        prompt_hash: model.prompt.hash.clone(),
                        temperature: model.settings.temperature,
                        max_output_tokens: model.settings.max_output_tokens,
                        timestamp: Utc::now(),
                        latency_ms: outcome.elapsed_ms,
                        attempts: outcome.attempts,
                    },
                };
                prediction_log.append(&record)?;
                checkpoint.stats.classified += 1;
                self.write_back(&id, &payload, checkpoint).await;
            }
            Err(err) => {
                error!("✗ {}: {}", id, err);
                let record = ErrorRecord::<L>::new(id, subject, description, None, err.to_string(), outcome.attempts);
                error_log.append(&record)?;
                checkpoint.stats.errors += 1;
            }
        }
        Ok(())
    }

    /// A failed write is counted and logged; processing continues.
    async fn write_back(&self, id: &str, payload: &Payload, checkpoint: &mut Checkpoint) {
        if self.options.dry_run {
            return;
        }
        match self.store.patch_row(id, &payload_to_map(payload)).await {
            Ok(()) => checkpoint.stats.updated += 1,
            Err(err) => {
                error!("PATCH failed for {}: {}", id, err);
                checkpoint.stats.write_failures += 1;
            }
        }
    }
}
