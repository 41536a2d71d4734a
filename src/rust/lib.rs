//! LLM classification of municipal service reports: is a report about
//! cycling (`relevance`), and if so, what kind of problem is it
//! (`category`). Includes the evaluation harness used to compare prompt
//! versions and models against gold datasets.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bikeclf::classifier::{Classifier, GeminiBackend, RelevanceLabel};
//! use bikeclf::prompts::format_prompt;
//!
//! let backend = GeminiBackend::new("GOOGLE_API_KEY", None, Duration::from_secs(60))?;
//! let classifier = Classifier::<RelevanceLabel>::new(Arc::new(backend));
//!
//! let prompt = format_prompt(
//!     "Entscheide, ob die Meldung den Radverkehr betrifft.",
//!     "Defekte Oberfläche",
//!     "Tiefes Schlagloch auf dem Radweg an der Aachener Straße",
//! );
//! let outcome = classifier
//!     .classify_with_retry(&prompt, "gemini-2.0-flash-001", 0.0, 512)
//!     .await;
//!
//! match outcome.decision() {
//!     Some(decision) => println!("{} ({:.2})", decision.label, decision.confidence),
//!     None => eprintln!("failed after {} attempts", outcome.attempts),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Evaluation runs
//!
//! [`runner::EvaluationRunner`] classifies every row of a [`dataset::Dataset`]
//! and writes a self-contained run directory (`predictions.jsonl`,
//! `errors.jsonl`, `metrics.json`, `config.json`, `misclassifications.md`).
//! [`report`] and [`metrics`] work on those files after the fact.

pub mod artifacts;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod metrics;
pub mod prompts;
pub mod records;
pub mod remote;
pub mod report;
pub mod runner;
pub mod sql;
pub mod telemetry;

pub use classifier::{Classifier, ClassifyError, Decision, IssueCategory, Label, Outcome, RelevanceLabel};
pub use config::{AppConfig, ConfigError, ModelInfo, TaskPaths, SUPPORTED_MODELS};
pub use dataset::{Dataset, DatasetError, DatasetRow};
pub use metrics::{compute_metrics, Metrics, MetricsError};
pub use records::{ErrorRecord, PredictionMeta, PredictionRecord, RunArtifacts, RunConfig};
pub use runner::{EvaluationRunner, RunError, RunSettings};

/// Initialises `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
/// Safe to call more than once.
pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .ok();
}
