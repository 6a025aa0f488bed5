use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::error::ScryError;
use crate::models::ImageSource;

/// A unit of work submitted to the pipeline.
///
/// Requests are consumed on submission. The generated `id` is the handle for
/// correlating results, errors, and log lines afterwards.
#[derive(Debug)]
pub struct OcrRequest {
    pub id: String,
    pub source: ImageSource,
    /// Higher values are admitted first. Ties fall back to submission order.
    pub priority: i32,
    /// Overrides the engine's default instruction for this request only.
    pub prompt: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl OcrRequest {
    pub fn new(source: impl Into<ImageSource>) -> Self {
        Self {
            id: nanoid!(),
            source: source.into(),
            priority: 0,
            prompt: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Lifecycle of a request inside the pipeline. `Succeeded` and `Failed` are
/// terminal and reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Admitted,
    InFlight,
    Succeeded,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Succeeded | RequestState::Failed)
    }
}

/// Successful recognition outcome for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub request_id: String,
    pub text: String,
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    /// Provider fields beyond the ones modelled here, passed along untouched.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Terminal failure for a single request, after the retry budget is spent or
/// a non-retryable error is hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrError {
    pub request_id: String,
    /// Stable taxonomy label, e.g. `TimeoutError` or `AuthError`.
    pub code: String,
    pub message: String,
    /// Attempts actually made. Zero when the request never reached the
    /// provider, e.g. normalization failures or shutdown cancellation.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl OcrError {
    pub fn new(request_id: impl Into<String>, error: &ScryError, attempts: u32) -> Self {
        Self {
            request_id: request_id.into(),
            code: error.code().to_string(),
            message: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Either terminal outcome, used where successes and failures travel together.
#[derive(Debug, Clone)]
pub enum OcrOutcome {
    Success(OcrResult),
    Failure(OcrError),
}

impl OcrOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            OcrOutcome::Success(result) => &result.request_id,
            OcrOutcome::Failure(error) => &error.request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OcrOutcome::Success(_))
    }

    pub fn into_result(self) -> Result<OcrResult, OcrError> {
        match self {
            OcrOutcome::Success(result) => Ok(result),
            OcrOutcome::Failure(error) => Err(error),
        }
    }
}

/// Point-in-time view of pipeline activity, emitted by the statistics stream.
///
/// The `submitted` / `succeeded` / `failed` counts cover the reporting window
/// only; `totals` accumulates over the pipeline's lifetime. `pending` and
/// `in_flight` are gauges sampled at `window_end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub in_flight: u64,
    /// Requests finishing per second over this window, successes and failures
    /// both counted.
    pub throughput: f64,
    pub totals: StatisticsTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsTotals {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}
