mod common;
mod integration;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::{pin_mut, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, timeout, Instant};

use scry::{
    NormalizedImage, Normalizer, NormalizerConfig, OcrEngine, OcrPayload, OcrRequest, OcrResult,
    Pipeline, PipelineConfig, ScryError,
};

use common::png_data_url;
use integration::init_test_logger;

/// Content type that makes [`FakeEngine`] reject the request.
const POISON_TYPE: &str = "application/x-fail";

/// Deterministic engine that records every call it sees: which label, when,
/// and how many were running at once.
struct FakeEngine {
    delay: Duration,
    calls: Mutex<Vec<(Instant, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn labels(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, label)| label.clone())
            .collect()
    }

    fn call_instants(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(instant, _)| *instant)
            .collect()
    }
}

fn decode_label(image: &NormalizedImage) -> String {
    general_purpose::STANDARD
        .decode(&image.data)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_else(|| image.data.clone())
}

#[async_trait]
impl OcrEngine for FakeEngine {
    async fn recognize(
        &self,
        image: &NormalizedImage,
        _prompt: Option<&str>,
    ) -> scry::Result<OcrPayload> {
        let label = decode_label(image);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.calls.lock().unwrap().push((Instant::now(), label.clone()));

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if image.content_type == POISON_TYPE {
            return Err(ScryError::ProviderReported("scripted rejection".to_string()));
        }
        Ok(OcrPayload {
            text: format!("read: {label}"),
            model: None,
            tokens_used: None,
            metadata: Default::default(),
        })
    }

    fn model(&self) -> &str {
        "fake-model"
    }
}

fn poison_data_url(label: &str) -> String {
    format!(
        "data:{};base64,{}",
        POISON_TYPE,
        general_purpose::STANDARD.encode(label)
    )
}

fn pipeline_config(
    max_concurrency: usize,
    rate_limit_count: usize,
    rate_limit_window: Duration,
) -> PipelineConfig {
    PipelineConfig {
        max_concurrency,
        retry_count: 3,
        request_timeout: Duration::from_secs(10),
        rate_limit_window,
        rate_limit_count,
        statistics_window: Duration::from_millis(100),
        channel_capacity: 32,
    }
}

fn pipeline(engine: Arc<FakeEngine>, config: PipelineConfig) -> Pipeline {
    let normalizer = Normalizer::new(NormalizerConfig {
        max_concurrency: 4,
        fetch_attempts: 1,
        fetch_timeout: Duration::from_secs(5),
    })
    .unwrap();
    Pipeline::new(engine, normalizer, config).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn drain_results(
    results: &mut broadcast::Receiver<OcrResult>,
    count: usize,
) -> Vec<OcrResult> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        match timeout(Duration::from_secs(60), results.recv()).await {
            Ok(Ok(result)) => collected.push(result),
            Ok(Err(error)) => panic!("results channel closed early: {error}"),
            Err(_) => panic!("timed out waiting for {count} result(s)"),
        }
    }
    collected
}

#[tokio::test(start_paused = true)]
async fn test_five_requests_finish_under_cap_and_rate() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::from_millis(120));
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(2, 5, Duration::from_secs(1)),
    );
    let mut results = pipeline.results();
    let mut errors = pipeline.errors();

    for i in 0..5 {
        pipeline
            .submit(OcrRequest::new(png_data_url(&format!("job-{i}"))))
            .unwrap();
    }

    let collected = drain_results(&mut results, 5).await;

    assert_eq!(collected.len(), 5);
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(engine.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_wins_when_capacity_frees_up() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::from_millis(200));
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(1, 100, Duration::from_millis(100)),
    );
    let mut results = pipeline.results();

    pipeline
        .submit(OcrRequest::new(png_data_url("hold")).with_priority(100))
        .unwrap();
    let engine_for_wait = Arc::clone(&engine);
    wait_until(|| !engine_for_wait.labels().is_empty(), "the holding request").await;

    // "low" is submitted first but "high" must be picked when the single
    // slot frees up.
    pipeline
        .submit(OcrRequest::new(png_data_url("low")).with_priority(1))
        .unwrap();
    pipeline
        .submit(OcrRequest::new(png_data_url("high")).with_priority(9))
        .unwrap();

    drain_results(&mut results, 3).await;
    assert_eq!(engine.labels(), vec!["hold", "high", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_never_violated() {
    init_test_logger();
    let window = Duration::from_millis(500);
    let engine = FakeEngine::new(Duration::ZERO);
    let pipeline = pipeline(Arc::clone(&engine), pipeline_config(10, 2, window));
    let mut results = pipeline.results();

    for i in 0..6 {
        pipeline
            .submit(OcrRequest::new(png_data_url(&format!("burst-{i}"))))
            .unwrap();
    }
    drain_results(&mut results, 6).await;

    let mut instants = engine.call_instants();
    instants.sort();
    for pair in instants.windows(3) {
        assert!(
            pair[2].duration_since(pair[0]) >= window,
            "three admissions within one rate window"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_rejected_request_does_not_disturb_the_batch() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::from_millis(10));
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(3, 100, Duration::from_millis(100)),
    );
    let mut results = pipeline.results();
    let mut errors = pipeline.errors();

    let poison_id = pipeline
        .submit(OcrRequest::new(poison_data_url("poison")))
        .unwrap();
    for i in 0..5 {
        pipeline
            .submit(OcrRequest::new(png_data_url(&format!("good-{i}"))))
            .unwrap();
    }

    let collected = drain_results(&mut results, 5).await;
    let texts: Vec<&str> = collected.iter().map(|r| r.text.as_str()).collect();
    for i in 0..5 {
        assert!(texts.contains(&format!("read: good-{i}").as_str()));
    }

    let failure = timeout(Duration::from_secs(60), errors.recv())
        .await
        .expect("timed out waiting for the failure")
        .unwrap();
    assert_eq!(failure.request_id, poison_id);
    assert_eq!(failure.code, "ProviderReportedError");
    assert!(failure.message.contains("scripted rejection"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_data_url_leaves_the_pipeline_responsive() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::ZERO);
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(2, 100, Duration::from_millis(100)),
    );
    let mut results = pipeline.results();
    let mut errors = pipeline.errors();

    // A bare media type with no payload section is malformed but not blank,
    // so it surfaces as a failure rather than being silently dropped.
    let bad_id = pipeline.submit(OcrRequest::new("data:image/png")).unwrap();

    let failure = timeout(Duration::from_secs(60), errors.recv())
        .await
        .expect("timed out waiting for the failure")
        .unwrap();
    assert_eq!(failure.request_id, bad_id);
    assert_eq!(failure.code, "ArgumentError");
    assert_eq!(failure.attempts, 0);

    let good_id = pipeline
        .submit(OcrRequest::new(png_data_url("still alive")))
        .unwrap();
    let collected = drain_results(&mut results, 1).await;
    assert_eq!(collected[0].request_id, good_id);
    assert!(pipeline.is_accepting());
}

#[tokio::test(start_paused = true)]
async fn test_late_subscribers_only_see_new_outcomes() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::ZERO);
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(1, 100, Duration::from_millis(100)),
    );
    let mut early = pipeline.results();

    let first_id = pipeline
        .submit(OcrRequest::new(png_data_url("first")))
        .unwrap();
    let collected = drain_results(&mut early, 1).await;
    assert_eq!(collected[0].request_id, first_id);

    let mut late = pipeline.results();
    let second_id = pipeline
        .submit(OcrRequest::new(png_data_url("second")))
        .unwrap();

    // The late subscriber starts from its attach point: its very first
    // delivery is the second request, not a replay of the first.
    let seen = timeout(Duration::from_secs(60), late.recv())
        .await
        .expect("timed out waiting for the late subscriber")
        .unwrap();
    assert_eq!(seen.request_id, second_id);

    let also_seen = drain_results(&mut early, 1).await;
    assert_eq!(also_seen[0].request_id, second_id);
}

#[tokio::test(start_paused = true)]
async fn test_statistics_report_window_deltas_and_running_totals() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::ZERO);
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(2, 100, Duration::from_millis(100)),
    );
    let mut results = pipeline.results();

    let stats = pipeline.statistics_every(Duration::from_millis(100));
    pin_mut!(stats);

    // Quiet baseline window before any work.
    let baseline = stats.next().await.expect("statistics stream ended early");
    assert_eq!(baseline.submitted, 0);
    assert_eq!(baseline.totals.submitted, 0);
    assert_eq!(baseline.throughput, 0.0);
    assert!(baseline.window_end >= baseline.window_start);

    for i in 0..3 {
        pipeline
            .submit(OcrRequest::new(png_data_url(&format!("stat-{i}"))))
            .unwrap();
    }
    drain_results(&mut results, 3).await;

    let window_secs = Duration::from_millis(100).as_secs_f64();
    let mut windowed_submitted = 0;
    let mut windowed_succeeded = 0;
    let mut ticks = 0;
    let settled = loop {
        let snapshot = stats.next().await.expect("statistics stream ended early");
        windowed_submitted += snapshot.submitted;
        windowed_succeeded += snapshot.succeeded;
        let expected_rate = (snapshot.succeeded + snapshot.failed) as f64 / window_secs;
        assert!((snapshot.throughput - expected_rate).abs() < 1e-9);
        if snapshot.totals.succeeded == 3 {
            break snapshot;
        }
        ticks += 1;
        assert!(ticks < 100, "statistics never caught up");
    };

    // Window deltas sum to the totals, and nothing is left in the system.
    assert_eq!(windowed_submitted, 3);
    assert_eq!(windowed_succeeded, 3);
    assert_eq!(settled.totals.submitted, 3);
    assert_eq!(settled.totals.failed, 0);
    assert_eq!(settled.pending, 0);
    assert_eq!(settled.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_finishes_in_flight_work_and_discards_pending() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::from_millis(300));
    let pipeline = pipeline(
        Arc::clone(&engine),
        pipeline_config(1, 100, Duration::from_millis(100)),
    );
    let mut results = pipeline.results();
    let mut errors = pipeline.errors();

    let blocker_id = pipeline
        .submit(OcrRequest::new(png_data_url("blocker")))
        .unwrap();
    let engine_for_wait = Arc::clone(&engine);
    wait_until(|| !engine_for_wait.labels().is_empty(), "the blocker").await;

    for i in 0..3 {
        pipeline
            .submit(OcrRequest::new(png_data_url(&format!("doomed-{i}"))))
            .unwrap();
    }

    pipeline.shutdown().await;

    // The in-flight request ran to completion; the queued ones evaporated.
    let finished = results.try_recv().unwrap();
    assert_eq!(finished.request_id, blocker_id);
    assert!(matches!(results.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(engine.labels(), vec!["blocker"]);

    assert!(!pipeline.is_accepting());
    match pipeline.submit(OcrRequest::new(png_data_url("too late"))) {
        Err(ScryError::Argument(_)) => {}
        other => panic!("Expected rejection after shutdown, got: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_work_that_overruns_the_grace_period() {
    init_test_logger();
    let engine = FakeEngine::new(Duration::from_secs(60));
    let mut config = pipeline_config(1, 100, Duration::from_millis(100));
    config.request_timeout = Duration::from_millis(500);
    let pipeline = pipeline(Arc::clone(&engine), config);
    let mut errors = pipeline.errors();

    let stuck_id = pipeline
        .submit(OcrRequest::new(png_data_url("stuck")))
        .unwrap();
    let engine_for_wait = Arc::clone(&engine);
    wait_until(|| !engine_for_wait.labels().is_empty(), "the stuck request").await;

    pipeline.shutdown().await;

    let failure = errors.try_recv().unwrap();
    assert_eq!(failure.request_id, stuck_id);
    assert_eq!(failure.code, "TransientProviderError");
    assert!(failure.message.contains("cancelled during pipeline shutdown"));
    assert_eq!(failure.attempts, 0);
}
