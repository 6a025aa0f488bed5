//! Text recognition against vision model providers.
//!
//! [`OcrEngine`] is the seam between the rest of the crate and any
//! recognition backend. [`OcrApiClient`] speaks the HTTP envelope protocol
//! and makes exactly one attempt per call; [`Invoker`] owns retries,
//! concurrency limits, and rate limiting on top of it. [`OcrProvider`]
//! selects a usable backend at construction and degrades gracefully when
//! credentials are missing.

mod api;
mod engine;
mod invoker;
mod limiter;
mod provider;

pub use api::*;
pub use engine::*;
pub use invoker::*;
pub use limiter::*;
pub use provider::*;
