//! Persisted record types shared by the evaluation runner and the remote
//! pipeline.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer, Serialize};

use crate::classifier::{Decision, Label};
use crate::metrics::Metrics;

/// Provenance of one prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionMeta {
    pub model_id: String,
    pub prompt_version: String,
    #[serde(default)]
    pub prompt_hash: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    #[serde(alias = "timestamp_utc")]
    pub timestamp: DateTime<Utc>,
    /// Wall time across all attempts
    pub latency_ms: u64,
    #[serde(default = "one")]
    pub attempts: u8,
}

fn one() -> u8 {
    1
}

/// One successfully classified item.
///
/// `gold` is absent for rows fetched from the remote store, which carry no
/// ground truth. The gold key on disk is task specific (`gold_label` or
/// `gold_category`).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord<L: Label> {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub gold: Option<String>,
    pub pred: Decision<L>,
    pub meta: PredictionMeta,
}

impl<L: Label> PredictionRecord<L> {
    pub fn predicted(&self) -> &'static str {
        self.pred.label.as_str()
    }

    /// `None` when there is no gold value to compare against.
    pub fn is_correct(&self) -> Option<bool> {
        self.gold.as_deref().map(|gold| gold == self.predicted())
    }
}

impl<L: Label> Serialize for PredictionRecord<L> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PredictionRecord", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("subject", &self.subject)?;
        state.serialize_field("description", &self.description)?;
        if let Some(gold) = &self.gold {
            state.serialize_field(L::GOLD_KEY, gold)?;
        }
        state.serialize_field("pred", &self.pred)?;
        state.serialize_field("meta", &self.meta)?;
        state.end()
    }
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "L: Label"))]
struct RawPrediction<L: Label> {
    id: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    description: String,
    gold_label: Option<String>,
    gold_category: Option<String>,
    pred: Decision<L>,
    meta: PredictionMeta,
}

impl<'de, L: Label> Deserialize<'de> for PredictionRecord<L> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawPrediction::<L>::deserialize(deserializer)?;
        Ok(PredictionRecord {
            id: raw.id,
            subject: raw.subject,
            description: raw.description,
            gold: raw.gold_label.or(raw.gold_category),
            pred: raw.pred,
            meta: raw.meta,
        })
    }
}

/// A row that failed both classification attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord<L: Label> {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub gold: Option<String>,
    pub error: String,
    pub attempts: u8,
    pub timestamp: DateTime<Utc>,
    _label: PhantomData<L>,
}

impl<L: Label> ErrorRecord<L> {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        description: impl Into<String>,
        gold: Option<String>,
        error: impl Into<String>,
        attempts: u8,
    ) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            description: description.into(),
            gold,
            error: error.into(),
            attempts,
            timestamp: Utc::now(),
            _label: PhantomData,
        }
    }
}

impl<L: Label> Serialize for ErrorRecord<L> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ErrorRecord", 7)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("subject", &self.subject)?;
        state.serialize_field("description", &self.description)?;
        if let Some(gold) = &self.gold {
            state.serialize_field(L::GOLD_KEY, gold)?;
        }
        state.serialize_field("error", &self.error)?;
        state.serialize_field("attempts", &self.attempts)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.end()
    }
}

/// Immutable snapshot of one evaluation run's parameters and counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub task: String,
    pub model_id: String,
    pub model_display_name: String,
    pub prompt_version: String,
    pub prompt_hash: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub dataset_path: String,
    pub dataset_rows: usize,
    pub processed_rows: usize,
    pub successful_predictions: usize,
    pub failed_predictions: usize,
    #[serde(default)]
    pub interrupted: bool,
    pub git_commit: String,
    #[serde(alias = "timestamp_utc")]
    pub timestamp: DateTime<Utc>,
}

/// Everything one evaluation run produced.
#[derive(Debug, Clone)]
pub struct RunArtifacts<L: Label> {
    pub run_dir: std::path::PathBuf,
    pub config: RunConfig,
    pub predictions: Vec<PredictionRecord<L>>,
    pub errors: Vec<ErrorRecord<L>>,
    pub metrics: Option<Metrics>,
}
