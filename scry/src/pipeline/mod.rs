//! Prioritized, rate-limited request pipeline.
//!
//! Submission is non-blocking for the pipeline's whole lifetime: requests
//! land in an unbounded intake channel and wait in a priority queue. A single
//! admission loop grants capacity (a concurrency permit, then a rate slot)
//! before picking the next request, so the highest-priority request at the
//! moment capacity frees up is the one admitted. Terminal outcomes fan out on
//! broadcast channels that stay open until shutdown; subscribers can attach
//! and detach at any time and only observe outcomes from after they attached.

mod queue;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, PipelineConfig};
use crate::error::{Result, ScryError};
use crate::models::{
    OcrError, OcrRequest, OcrResult, PipelineStatistics, RequestState, StatisticsTotals,
};
use crate::normalize::Normalizer;
use crate::ocr::{Invoker, OcrEngine, OcrProvider};

use queue::PendingQueue;
use stats::StatsCollector;

pub struct Pipeline {
    invoker: Arc<Invoker>,
    intake: mpsc::UnboundedSender<OcrRequest>,
    results_tx: broadcast::Sender<OcrResult>,
    errors_tx: broadcast::Sender<OcrError>,
    stats: Arc<StatsCollector>,
    intake_token: CancellationToken,
    work_token: CancellationToken,
    stats_token: CancellationToken,
    tracker: TaskTracker,
    accepting: AtomicBool,
}

impl Pipeline {
    /// Start a pipeline over the given engine. Spawns the admission loop, so
    /// this must be called from within a Tokio runtime.
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        normalizer: Normalizer,
        config: PipelineConfig,
    ) -> Result<Self> {
        let invoker = Arc::new(Invoker::new(engine, normalizer, config)?);
        let capacity = invoker.config().channel_capacity;

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (results_tx, _) = broadcast::channel(capacity);
        let (errors_tx, _) = broadcast::channel(capacity);
        let stats = Arc::new(StatsCollector::default());
        let intake_token = CancellationToken::new();
        let work_token = CancellationToken::new();
        let stats_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(
            AdmissionLoop {
                invoker: Arc::clone(&invoker),
                intake: intake_rx,
                results_tx: results_tx.clone(),
                errors_tx: errors_tx.clone(),
                stats: Arc::clone(&stats),
                intake_token: intake_token.clone(),
                work_token: work_token.clone(),
                tracker: tracker.clone(),
            }
            .run(),
        );

        tracing::info!(
            "Pipeline started (concurrency cap {}, rate limit {}/{:?})",
            invoker.config().max_concurrency,
            invoker.config().rate_limit_count,
            invoker.config().rate_limit_window
        );

        Ok(Self {
            invoker,
            intake: intake_tx,
            results_tx,
            errors_tx,
            stats,
            intake_token,
            work_token,
            stats_token,
            tracker,
            accepting: AtomicBool::new(true),
        })
    }

    /// Build the full production stack from configuration: API-backed engine
    /// with graceful degradation, normalizer, and pipeline.
    pub fn from_config(config: Config) -> Result<Self> {
        let engine = Arc::new(OcrProvider::new(&config.ocr));
        let normalizer = Normalizer::new(config.normalizer)?;
        Self::new(engine, normalizer, config.pipeline)
    }

    /// Queue a request for processing and return its id.
    ///
    /// Never blocks and never waits for capacity. Blank inputs are accepted
    /// here but silently dropped before admission; they produce neither a
    /// result nor an error. After [`Pipeline::shutdown`] begins, submission
    /// fails with an argument error.
    pub fn submit(&self, request: OcrRequest) -> Result<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ScryError::Argument("pipeline is shut down".to_string()));
        }
        let id = request.id.clone();
        self.stats.record_submitted();
        if self.intake.send(request).is_err() {
            self.stats.record_discarded(1);
            return Err(ScryError::Argument("pipeline is shut down".to_string()));
        }
        tracing::debug!("Request {} submitted", id);
        Ok(id)
    }

    /// Subscribe to successful outcomes. Each subscriber sees every result
    /// broadcast after the moment it subscribed.
    pub fn results(&self) -> broadcast::Receiver<OcrResult> {
        self.results_tx.subscribe()
    }

    /// Subscribe to terminal failures.
    pub fn errors(&self) -> broadcast::Receiver<OcrError> {
        self.errors_tx.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Activity snapshots at the configured cadence.
    pub fn statistics(&self) -> impl Stream<Item = PipelineStatistics> {
        self.statistics_every(self.invoker.config().statistics_window)
    }

    /// Activity snapshots, one per `window`.
    ///
    /// Sampling reads atomic counters and never contends with request
    /// processing. Windowed counts are deltas since the previous emission;
    /// the first window starts when this stream is created. The stream ends
    /// when the pipeline finishes shutting down.
    pub fn statistics_every(&self, window: Duration) -> impl Stream<Item = PipelineStatistics> {
        let collector = Arc::clone(&self.stats);
        let token = self.stats_token.clone();
        // interval() panics on a zero period.
        let window = window.max(Duration::from_millis(1));

        async_stream::stream! {
            let mut prev = collector.sample();
            let mut window_start = Utc::now();
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = collector.sample();
                        let window_end = Utc::now();
                        let succeeded = current.succeeded.saturating_sub(prev.succeeded);
                        let failed = current.failed.saturating_sub(prev.failed);
                        yield PipelineStatistics {
                            window_start,
                            window_end,
                            submitted: current.submitted.saturating_sub(prev.submitted),
                            succeeded,
                            failed,
                            pending: current.pending,
                            in_flight: current.in_flight,
                            throughput: (succeeded + failed) as f64 / window.as_secs_f64(),
                            totals: StatisticsTotals {
                                submitted: current.submitted,
                                succeeded: current.succeeded,
                                failed: current.failed,
                            },
                        };
                        prev = current;
                        window_start = window_end;
                    }
                }
            }
        }
    }

    /// Stop the pipeline: refuse new submissions, discard everything still
    /// queued, and give in-flight requests one request-timeout of grace to
    /// finish before cancelling them. Cancelled requests are reported on the
    /// errors channel. Idempotent.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!("Pipeline shutting down");
        }
        self.intake_token.cancel();
        self.tracker.close();

        let grace = self.invoker.config().request_timeout;
        tokio::select! {
            _ = self.tracker.wait() => {}
            _ = tokio::time::sleep(grace) => {
                tracing::warn!("Shutdown grace period expired, cancelling in-flight requests");
                self.work_token.cancel();
                self.tracker.wait().await;
            }
        }

        self.stats_token.cancel();
        tracing::info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.intake_token.cancel();
        self.stats_token.cancel();
    }
}

struct AdmissionLoop {
    invoker: Arc<Invoker>,
    intake: mpsc::UnboundedReceiver<OcrRequest>,
    results_tx: broadcast::Sender<OcrResult>,
    errors_tx: broadcast::Sender<OcrError>,
    stats: Arc<StatsCollector>,
    intake_token: CancellationToken,
    work_token: CancellationToken,
    tracker: TaskTracker,
}

impl AdmissionLoop {
    async fn run(mut self) {
        let semaphore = self.invoker.concurrency_gate();
        let limiter = self.invoker.rate_limiter();
        let mut queue = PendingQueue::default();

        'outer: loop {
            while let Ok(request) = self.intake.try_recv() {
                enqueue(&mut queue, request, &self.stats);
            }

            if queue.is_empty() {
                tokio::select! {
                    _ = self.intake_token.cancelled() => break 'outer,
                    maybe = self.intake.recv() => match maybe {
                        Some(request) => enqueue(&mut queue, request, &self.stats),
                        None => break 'outer,
                    },
                }
                continue;
            }

            // Capacity first, pick second: whatever is highest-priority when
            // a slot frees up is what gets admitted.
            let permit = tokio::select! {
                _ = self.intake_token.cancelled() => break 'outer,
                acquired = semaphore.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break 'outer,
                },
            };

            tokio::select! {
                _ = self.intake_token.cancelled() => {
                    drop(permit);
                    break 'outer;
                }
                _ = limiter.acquire() => {}
            }

            while let Ok(request) = self.intake.try_recv() {
                enqueue(&mut queue, request, &self.stats);
            }

            let Some(request) = queue.pop() else {
                drop(permit);
                continue;
            };

            self.stats.record_admitted();
            tracing::debug!("Request {} {:?}", request.id, RequestState::Admitted);
            self.spawn_task(request, permit);
        }

        let mut discarded = queue.len() as u64;
        while self.intake.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.stats.record_discarded(discarded);
            tracing::info!("Discarded {} pending request(s) at shutdown", discarded);
        }
    }

    fn spawn_task(&self, request: OcrRequest, permit: OwnedSemaphorePermit) {
        let invoker = Arc::clone(&self.invoker);
        let results_tx = self.results_tx.clone();
        let errors_tx = self.errors_tx.clone();
        let stats = Arc::clone(&self.stats);
        let work_token = self.work_token.clone();

        self.tracker.spawn(async move {
            // Held until this request reaches a terminal state.
            let _permit = permit;
            let id = request.id.clone();
            tracing::debug!("Request {} {:?}", id, RequestState::InFlight);

            tokio::select! {
                run = invoker.execute(request) => match run.result {
                    Ok(result) => {
                        stats.record_succeeded();
                        tracing::debug!("Request {} {:?}", id, RequestState::Succeeded);
                        let _ = results_tx.send(result);
                    }
                    Err(error) => {
                        stats.record_failed();
                        tracing::debug!("Request {} {:?}: {}", id, RequestState::Failed, error);
                        let _ = errors_tx.send(OcrError::new(run.id, &error, run.attempts));
                    }
                },
                _ = work_token.cancelled() => {
                    stats.record_failed();
                    let error = ScryError::TransientProvider(
                        "cancelled during pipeline shutdown".to_string(),
                    );
                    tracing::warn!("Request {} {:?}: {}", id, RequestState::Failed, error);
                    let _ = errors_tx.send(OcrError::new(id.clone(), &error, 0));
                }
            }
        });
    }
}

fn enqueue(queue: &mut PendingQueue, request: OcrRequest, stats: &StatsCollector) {
    if request.source.is_blank() {
        tracing::debug!("Skipping blank input for request {}", request.id);
        stats.record_skipped();
        return;
    }
    tracing::debug!("Request {} {:?}", request.id, RequestState::Queued);
    queue.push(request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::NormalizerConfig;
    use crate::models::NormalizedImage;
    use crate::ocr::OcrPayload;

    struct EchoEngine;

    #[async_trait]
    impl OcrEngine for EchoEngine {
        async fn recognize(
            &self,
            _image: &NormalizedImage,
            _prompt: Option<&str>,
        ) -> Result<OcrPayload> {
            Ok(OcrPayload {
                text: "echo".to_string(),
                model: None,
                tokens_used: None,
                metadata: serde_json::Map::new(),
            })
        }

        fn model(&self) -> &str {
            "echo"
        }
    }

    /// Collects formatted log output so tests can assert on it.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> LogBuffer {
            self.clone()
        }
    }

    fn test_pipeline() -> Pipeline {
        let normalizer = Normalizer::new(NormalizerConfig {
            max_concurrency: 4,
            fetch_attempts: 1,
            fetch_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let config = PipelineConfig {
            max_concurrency: 2,
            retry_count: 3,
            request_timeout: Duration::from_secs(5),
            rate_limit_window: Duration::from_millis(50),
            rate_limit_count: 100,
            statistics_window: Duration::from_millis(50),
            channel_capacity: 16,
        };
        Pipeline::new(Arc::new(EchoEngine), normalizer, config).unwrap()
    }

    #[tokio::test]
    async fn test_submitted_request_produces_broadcast_result() {
        let pipeline = test_pipeline();
        let mut results = pipeline.results();

        let id = pipeline
            .submit(OcrRequest::new("data:image/png;base64,aGk="))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.request_id, id);
        assert_eq!(result.text, "echo");

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pipeline = test_pipeline();
        assert!(pipeline.is_accepting());

        pipeline.shutdown().await;
        assert!(!pipeline.is_accepting());

        let err = pipeline
            .submit(OcrRequest::new("data:image/png;base64,aGk="))
            .unwrap_err();
        assert!(matches!(err, ScryError::Argument(_)));
    }

    #[tokio::test]
    async fn test_blank_submission_emits_nothing() {
        let pipeline = test_pipeline();
        let mut results = pipeline.results();
        let mut errors = pipeline.errors();

        pipeline.submit(OcrRequest::new("")).unwrap();
        let good = pipeline
            .submit(OcrRequest::new("data:image/png;base64,aGk="))
            .unwrap();

        // Only the non-blank request reaches a terminal state.
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.request_id, good);
        assert!(errors.try_recv().is_err());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pipeline = test_pipeline();
        pipeline.shutdown().await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_is_logged_at_info() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();

        let pipeline = tracing::subscriber::with_default(subscriber, test_pipeline);

        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("Pipeline started"), "logs were: {logs}");

        pipeline.shutdown().await;
    }
}
