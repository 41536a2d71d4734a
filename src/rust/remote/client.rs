use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::{Map, Value};

use super::writeback::EventRow;
use crate::config::SupabaseSettings;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const EVENTS_PATH: &str = "/rest/v1/events";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Supabase request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Supabase API error: HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected Supabase response: {0}")]
    Decode(String),
}

/// Keyset-paginated fetch of one batch of events.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchQuery<'a> {
    pub select: &'a str,
    /// Only rows with a key strictly greater than this
    pub after: Option<&'a str>,
    pub limit: usize,
    pub filters: &'a [(String, String)],
}

impl BatchQuery<'_> {
    /// PostgREST query parameters, ordered by key.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("select".to_string(), self.select.to_string()),
            ("order".to_string(), "service_request_id".to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(after) = self.after {
            params.push(("service_request_id".to_string(), format!("gt.{}", after)));
        }
        params.extend(self.filters.iter().cloned());
        params
    }
}

/// The remote table classification results are written back to.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn fetch_batch(&self, query: &BatchQuery<'_>) -> Result<Vec<EventRow>, RemoteError>;

    /// Partial update of one row by key.
    async fn patch_row(&self, id: &str, payload: &Map<String, Value>) -> Result<(), RemoteError>;
}

/// Delay before retry number `attempt` (1-based): doubles from
/// [`BASE_DELAY`], capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    std::cmp::min(BASE_DELAY.saturating_mul(factor), MAX_DELAY)
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// [`EventStore`] over the Supabase PostgREST API.
pub struct SupabaseStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseStore {
    pub fn new(settings: &SupabaseSettings, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.service_role_key.clone(),
        })
    }

    fn events_url(&self) -> String {
        format!("{}{}", self.base_url, EVENTS_PATH)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    /// Sends with up to [`MAX_ATTEMPTS`] tries. Transport errors, 5xx and 429
    /// are retried; any other non-success status fails immediately.
    async fn send_with_retry<F, Fut>(&self, what: &str, mut send: F) -> Result<reqwest::Response, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 1;
        loop {
            let error = match send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let error = RemoteError::Status {
                        status: status.as_u16(),
                        body,
                    };
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    error
                }
                Err(err) => RemoteError::Http(err),
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(error);
            }
            let delay = backoff_delay(attempt);
            warn!(
                "{} failed (attempt {}/{}), retrying in {:?}: {}",
                what, attempt, MAX_ATTEMPTS, delay, error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl EventStore for SupabaseStore {
    async fn fetch_batch(&self, query: &BatchQuery<'_>) -> Result<Vec<EventRow>, RemoteError> {
        let params = query.params();
        let response = self
            .send_with_retry("Fetch", || {
                self.authorized(self.http.get(self.events_url()))
                    .query(&params)
                    .send()
            })
            .await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn patch_row(&self, id: &str, payload: &Map<String, Value>) -> Result<(), RemoteError> {
        let key = [("service_request_id", format!("eq.{}", id))];
        self.send_with_retry("PATCH", || {
            self.authorized(self.http.patch(self.events_url()))
                .header("Prefer", "return=minimal")
                .query(&key)
                .json(payload)
                .send()
        })
        .await?;
        Ok(())
    }
}
