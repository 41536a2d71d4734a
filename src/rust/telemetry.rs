//! Optional per-item tracing to Langfuse.
//!
//! The runner and the remote pipeline only ever see `Arc<dyn TraceSink>`.
//! Which implementation sits behind it is decided once at startup: a
//! `LangfuseSink` when credentials are configured, otherwise `NoopSink`.
//! Tracing problems are logged and never fail a run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::config::LangfuseSettings;

/// One classified item, as reported to the tracing backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub name: String,
    pub item_id: String,
    pub model_id: String,
    pub prompt_version: String,
    pub input: String,
    /// The validated decision, if any
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u8,
    pub latency_ms: u64,
    pub start_time: DateTime<Utc>,
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Buffers the event. Never blocks on the network.
    fn record(&self, event: TraceEvent);

    /// Ships everything buffered so far.
    async fn flush(&self);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl TraceSink for NoopSink {
    fn record(&self, _event: TraceEvent) {}

    async fn flush(&self) {}
}

/// Sends buffered events to the Langfuse ingestion API as
/// `generation-create` entries.
pub struct LangfuseSink {
    http: reqwest::Client,
    settings: LangfuseSettings,
    buffer: Mutex<Vec<TraceEvent>>,
    sequence: AtomicU64,
}

impl LangfuseSink {
    pub fn new(settings: LangfuseSettings, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            settings,
            buffer: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ingestion_url(&self) -> String {
        format!("{}/api/public/ingestion", self.settings.host.trim_end_matches('/'))
    }

    fn batch_entry(&self, event: &TraceEvent) -> Value {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{}", event.item_id, event.start_time.timestamp_millis(), seq);
        let end_time = event.start_time + chrono::Duration::milliseconds(event.latency_ms as i64);

        json!({
            "id": format!("event-{}", id),
            "timestamp": Utc::now().to_rfc3339(),
            "type": "generation-create",
            "body": {
                "id": id,
                "name": event.name,
                "startTime": event.start_time.to_rfc3339(),
                "endTime": end_time.to_rfc3339(),
                "model": event.model_id,
                "input": event.input,
                "output": event.output,
                "level": if event.error.is_some() { "ERROR" } else { "DEFAULT" },
                "statusMessage": event.error,
                "metadata": {
                    "item_id": event.item_id,
                    "prompt_version": event.prompt_version,
                    "attempts": event.attempts,
                    "latency_ms": event.latency_ms,
                },
            },
        })
    }
}

#[async_trait]
impl TraceSink for LangfuseSink {
    fn record(&self, event: TraceEvent) {
        self.lock().push(event);
    }

    async fn flush(&self) {
        let events = std::mem::take(&mut *self.lock());
        if events.is_empty() {
            return;
        }

        let batch: Vec<Value> = events.iter().map(|event| self.batch_entry(event)).collect();
        let response = self
            .http
            .post(self.ingestion_url())
            .basic_auth(&self.settings.public_key, Some(&self.settings.secret_key))
            .json(&json!({ "batch": batch }))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!("Flushed {} trace events to Langfuse", events.len());
            }
            Ok(response) => {
                warn!(
                    "Langfuse rejected {} trace events: HTTP {}",
                    events.len(),
                    response.status()
                );
            }
            Err(err) => {
                warn!("Failed to flush {} trace events to Langfuse: {}", events.len(), err);
            }
        }
    }
}

/// Picks the sink for this process.
pub fn from_config(settings: Option<&LangfuseSettings>, timeout: Duration) -> Arc<dyn TraceSink> {
    let Some(settings) = settings else {
        info!("Langfuse not configured, tracing disabled");
        return Arc::new(NoopSink);
    };

    match LangfuseSink::new(settings.clone(), timeout) {
        Ok(sink) => {
            info!("Langfuse tracing enabled ({})", settings.host);
            Arc::new(sink)
        }
        Err(err) => {
            warn!("Failed to initialize Langfuse, continuing without tracing: {}", err);
            Arc::new(NoopSink)
        }
    }
}
