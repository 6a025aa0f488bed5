use async_trait::async_trait;

use crate::error::Result;
use crate::models::NormalizedImage;
use crate::ocr::OcrPayload;

/// A recognition backend.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Run one recognition attempt against the backend.
    ///
    /// Implementations must not retry internally; the caller owns the retry
    /// budget and counts attempts by counting calls to this method.
    async fn recognize(&self, image: &NormalizedImage, prompt: Option<&str>) -> Result<OcrPayload>;

    /// Model identifier reported on outcomes when the backend does not name
    /// one itself.
    fn model(&self) -> &str;
}
