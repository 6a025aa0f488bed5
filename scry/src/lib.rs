//! Scry turns image references into recognized text through a prioritized,
//! rate-limited pipeline backed by vision model APIs.
//!
//! The crate is layered: [`Normalizer`] converts every accepted input form
//! (URLs, raw bytes, data URLs, byte streams) into one canonical shape,
//! [`Invoker`] drives batches of recognition work under a concurrency cap,
//! a sliding-window rate limit, and a per-request retry budget, and
//! [`Pipeline`] adds priority-ordered admission with broadcast delivery of
//! outcomes for long-running services.
//!
//! ```no_run
//! use scry::{Config, OcrRequest, Pipeline};
//!
//! # async fn demo() -> scry::Result<()> {
//! let pipeline = Pipeline::from_config(Config::from_env())?;
//! let mut results = pipeline.results();
//!
//! pipeline.submit(OcrRequest::new("https://example.com/receipt.png").with_priority(5))?;
//!
//! if let Ok(result) = results.recv().await {
//!     println!("{}", result.text);
//! }
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod ocr;
pub mod pipeline;
pub mod sniff;

pub use config::{Config, NormalizerConfig, OcrApiConfig, PipelineConfig};
pub use error::{Result, ScryError};
pub use models::{
    ImageSource, NormalizeOutcome, NormalizedImage, OcrError, OcrOutcome, OcrRequest, OcrResult,
    PipelineStatistics, RequestState, StatisticsTotals,
};
pub use normalize::Normalizer;
pub use ocr::{Invoker, OcrApiClient, OcrEngine, OcrPayload, OcrProvider, SlidingWindow};
pub use pipeline::Pipeline;
pub use sniff::sniff_content_type;
