use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{Result, ScryError};
use crate::models::{OcrError, OcrOutcome, OcrRequest, OcrResult};
use crate::normalize::Normalizer;
use crate::ocr::{OcrEngine, SlidingWindow};

/// Outcome of driving one request through normalization and the attempt
/// loop, before it is shaped for a particular consumer.
pub(crate) struct RequestRun {
    pub(crate) id: String,
    pub(crate) attempts: u32,
    pub(crate) result: Result<OcrResult>,
}

/// Batch executor for recognition work.
///
/// Owns the provider-protection mechanisms: the concurrency cap, the
/// sliding-window rate limiter, and the per-request retry budget. Batch
/// streams admit each request through the cap and limiter exactly once;
/// retries for an admitted request never consume a second slot.
pub struct Invoker {
    engine: Arc<dyn OcrEngine>,
    normalizer: Normalizer,
    config: PipelineConfig,
    semaphore: Arc<Semaphore>,
    limiter: Arc<SlidingWindow>,
}

impl Invoker {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        normalizer: Normalizer,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let limiter = Arc::new(SlidingWindow::new(
            config.rate_limit_count,
            config.rate_limit_window,
        ));
        Ok(Self {
            engine,
            normalizer,
            config,
            semaphore,
            limiter,
        })
    }

    /// Run every request to its terminal outcome.
    ///
    /// Blank inputs (empty or whitespace-only references, empty buffers) are
    /// dropped before any work happens and produce no outcome at all. Each
    /// surviving request yields exactly one [`OcrOutcome`], in completion
    /// order; one request's failure never disturbs its siblings.
    pub fn invoke_all<I>(&self, requests: I) -> impl Stream<Item = OcrOutcome> + '_
    where
        I: IntoIterator<Item = OcrRequest>,
    {
        self.run_stream(requests).map(|run| match run.result {
            Ok(result) => OcrOutcome::Success(result),
            Err(error) => OcrOutcome::Failure(OcrError::new(run.id, &error, run.attempts)),
        })
    }

    /// Like [`Invoker::invoke_all`], but the first terminal failure ends the
    /// stream with an error and abandons the remaining work.
    pub fn try_invoke_all<I>(&self, requests: I) -> impl Stream<Item = Result<OcrResult>> + '_
    where
        I: IntoIterator<Item = OcrRequest>,
    {
        let runs = self.run_stream(requests);
        async_stream::try_stream! {
            pin_mut!(runs);
            while let Some(run) = runs.next().await {
                let result = run.result?;
                yield result;
            }
        }
    }

    fn run_stream<I>(&self, requests: I) -> impl Stream<Item = RequestRun> + '_
    where
        I: IntoIterator<Item = OcrRequest>,
    {
        // Futures are built up front so the returned stream owns them outright
        // instead of holding the caller's iterator. They stay inert until
        // `buffer_unordered` polls them.
        let tasks: Vec<_> = requests
            .into_iter()
            .filter_map(move |request| {
                if request.source.is_blank() {
                    tracing::debug!("Skipping blank input for request {}", request.id);
                    None
                } else {
                    Some(self.run_request(request))
                }
            })
            .collect();
        futures::stream::iter(tasks).buffer_unordered(self.config.max_concurrency)
    }

    async fn run_request(&self, request: OcrRequest) -> RequestRun {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return RequestRun {
                    id: request.id.clone(),
                    attempts: 0,
                    result: Err(ScryError::TransientProvider(
                        "admission gate closed".to_string(),
                    )),
                }
            }
        };
        self.limiter.acquire().await;
        self.execute(request).await
    }

    /// Normalize and run the attempt loop for an already-admitted request.
    ///
    /// Callers are responsible for holding a concurrency permit and having
    /// claimed a rate slot before calling this.
    pub(crate) async fn execute(&self, request: OcrRequest) -> RequestRun {
        let OcrRequest {
            id, source, prompt, ..
        } = request;
        let started = Instant::now();

        let image = match self.normalizer.normalize(source).await {
            Ok(image) => image,
            Err(error) => {
                tracing::warn!("Request {} failed during normalization: {}", id, error);
                return RequestRun {
                    id,
                    attempts: 0,
                    result: Err(error),
                };
            }
        };

        let mut last_error: Option<ScryError> = None;
        for attempt in 1..=self.config.retry_count {
            if attempt > 1 {
                let backoff = Duration::from_millis(100 * 2_u64.pow(attempt - 2));
                tokio::time::sleep(backoff).await;
            }

            let call = self.engine.recognize(&image, prompt.as_deref());
            let outcome = match tokio::time::timeout(self.config.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ScryError::Timeout(format!(
                    "no response within {:?}",
                    self.config.request_timeout
                ))),
            };

            match outcome {
                Ok(payload) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::debug!(
                        "Request {} recognized in {}ms after {} attempt(s)",
                        id,
                        duration_ms,
                        attempt
                    );
                    let model = payload
                        .model
                        .unwrap_or_else(|| self.engine.model().to_string());
                    return RequestRun {
                        id: id.clone(),
                        attempts: attempt,
                        result: Ok(OcrResult {
                            request_id: id,
                            text: payload.text,
                            model: Some(model),
                            tokens_used: payload.tokens_used,
                            duration_ms,
                            completed_at: Utc::now(),
                            metadata: payload.metadata,
                        }),
                    };
                }
                Err(error) if error.is_retryable() => {
                    if attempt < self.config.retry_count {
                        tracing::warn!(
                            "Attempt {}/{} for request {} failed: {}. Retrying.",
                            attempt,
                            self.config.retry_count,
                            id,
                            error
                        );
                    }
                    last_error = Some(error);
                }
                Err(error) => {
                    tracing::warn!("Request {} failed after {} attempt(s): {}", id, attempt, error);
                    return RequestRun {
                        id,
                        attempts: attempt,
                        result: Err(error),
                    };
                }
            }
        }

        let attempts = self.config.retry_count;
        let error = last_error
            .unwrap_or_else(|| ScryError::TransientProvider("retry budget exhausted".to_string()));
        tracing::warn!("Request {} failed after {} attempt(s): {}", id, attempts, error);
        RequestRun {
            id,
            attempts,
            result: Err(error),
        }
    }

    pub(crate) fn concurrency_gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub(crate) fn rate_limiter(&self) -> Arc<SlidingWindow> {
        Arc::clone(&self.limiter)
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
