//! In-memory stand-ins for the network collaborators.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bikeclf::classifier::{BackendError, GenerationBackend, GenerationRequest};
use bikeclf::remote::{BatchQuery, EventRow, EventStore, RemoteError};
use bikeclf::telemetry::{TraceEvent, TraceSink};
use env_logger::{Builder, Env};
use serde_json::{json, Map, Value};

pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// A decision object as the model would return it.
pub fn decision_json(field: &str, value: &str, confidence: f64) -> String {
    let mut object = Map::new();
    object.insert(field.to_string(), json!(value));
    object.insert("evidence".to_string(), json!(["Radweg"]));
    object.insert("reasoning".to_string(), json!("Der Radweg wird explizit genannt."));
    object.insert("confidence".to_string(), json!(confidence));
    Value::Object(object).to_string()
}

/// Replies from a fixed script, in order, and remembers every prompt.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Other("script exhausted".into())))
    }
}

/// Answers based on the prompt text, so results do not depend on call order.
pub struct RuleBackend<F> {
    rule: F,
    calls: AtomicUsize,
}

impl<F> RuleBackend<F>
where
    F: Fn(&str) -> Result<String, BackendError> + Send + Sync,
{
    pub fn new(rule: F) -> Self {
        Self {
            rule,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> GenerationBackend for RuleBackend<F>
where
    F: Fn(&str) -> Result<String, BackendError> + Send + Sync,
{
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.rule)(request.prompt)
    }
}

/// Sorted rows served by key, with configurable write failures.
#[derive(Default)]
pub struct FakeEventStore {
    rows: Vec<EventRow>,
    failing_patches: HashSet<String>,
    pub patches: Mutex<Vec<(String, Map<String, Value>)>>,
    pub queries: Mutex<Vec<Vec<(String, String)>>>,
}

impl FakeEventStore {
    pub fn new(mut rows: Vec<EventRow>) -> Self {
        rows.sort_by(|a, b| a.service_request_id.cmp(&b.service_request_id));
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn failing_patch(mut self, id: &str) -> Self {
        self.failing_patches.insert(id.to_string());
        self
    }

    pub fn patched_ids(&self) -> Vec<String> {
        self.patches.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn patch_for(&self, id: &str) -> Option<Map<String, Value>> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .find(|(patched, _)| patched == id)
            .map(|(_, payload)| payload.clone())
    }
}

#[async_trait]
impl EventStore for FakeEventStore {
    async fn fetch_batch(&self, query: &BatchQuery<'_>) -> Result<Vec<EventRow>, RemoteError> {
        self.queries.lock().unwrap().push(query.params());
        Ok(self
            .rows
            .iter()
            .filter(|row| query.after.map_or(true, |after| row.service_request_id.as_str() > after))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn patch_row(&self, id: &str, payload: &Map<String, Value>) -> Result<(), RemoteError> {
        if self.failing_patches.contains(id) {
            return Err(RemoteError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        self.patches.lock().unwrap().push((id.to_string(), payload.clone()));
        Ok(())
    }
}

pub fn event(id: &str, service_name: &str, title: &str, description: Option<&str>) -> EventRow {
    EventRow {
        service_request_id: id.to_string(),
        title: Some(title.to_string()),
        description: description.map(String::from),
        service_name: Some(service_name.to_string()),
        ..EventRow::default()
    }
}

/// Keeps every recorded event; counts flushes.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<TraceEvent>>,
    pub flushes: AtomicUsize,
}

impl RecordingSink {
    pub fn recorded(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl TraceSink for RecordingSink {
    fn record(&self, event: TraceEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}
