//! Input normalization.
//!
//! Every accepted input form (URL, raw bytes, data URL, byte stream) is
//! converted to a [`NormalizedImage`]: a content type plus base64 payload.
//! Data URLs pass through without fetching or re-encoding. Remote URLs are
//! fetched with bounded retries, and their content type is resolved from the
//! response header first, then signature sniffing, then a generic fallback.

mod fetch;

use base64::{engine::general_purpose, Engine as _};
use futures::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::config::NormalizerConfig;
use crate::error::{Result, ScryError};
use crate::models::{ImageSource, NormalizeOutcome, NormalizedImage};
use crate::sniff::sniff_content_type;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

pub struct Normalizer {
    client: reqwest::Client,
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(concat!("scry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScryError::Fetch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Convert a single input into canonical form.
    ///
    /// Data URLs are structural passthroughs: the payload is never decoded,
    /// re-encoded, or fetched. Empty and whitespace-only inputs are rejected
    /// with an argument error before any network activity.
    pub async fn normalize(&self, source: ImageSource) -> Result<NormalizedImage> {
        match source {
            ImageSource::Url(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(ScryError::Argument("image reference is empty".to_string()));
                }
                let (bytes, header_type) = self.fetch_bytes(url).await?;
                Ok(encode_bytes(&bytes, header_type))
            }
            ImageSource::DataUrl(url) => parse_data_url(url.trim()),
            ImageSource::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(ScryError::Argument("image buffer is empty".to_string()));
                }
                Ok(encode_bytes(&bytes, None))
            }
            ImageSource::Stream(mut reader) => {
                let mut bytes = Vec::new();
                reader
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| ScryError::Fetch(format!("Failed to read stream: {}", e)))?;
                if bytes.is_empty() {
                    return Err(ScryError::Argument("stream produced no data".to_string()));
                }
                Ok(encode_bytes(&bytes, None))
            }
        }
    }

    /// Normalize a batch of inputs with bounded concurrency.
    ///
    /// Yields one [`NormalizeOutcome`] per input in completion order. A failed
    /// item becomes an error outcome; it never ends the stream.
    pub fn normalize_many<I>(&self, sources: I) -> impl Stream<Item = NormalizeOutcome> + '_
    where
        I: IntoIterator<Item = ImageSource>,
    {
        // Futures are built up front so the returned stream owns them outright
        // instead of holding the caller's iterator. They stay inert until
        // `buffer_unordered` polls them.
        let tasks: Vec<_> = sources
            .into_iter()
            .map(move |source| {
                let label = source.describe();
                async move {
                    let started = Instant::now();
                    let result = self.normalize(source).await;
                    let elapsed = started.elapsed().as_millis() as u64;
                    match result {
                        Ok(image) => NormalizeOutcome::ok(label, image, elapsed),
                        Err(error) => {
                            tracing::warn!("Normalization failed for {}: {}", label, error);
                            NormalizeOutcome::err(label, error, elapsed)
                        }
                    }
                }
            })
            .collect();
        futures::stream::iter(tasks).buffer_unordered(self.config.max_concurrency)
    }
}

fn encode_bytes(bytes: &[u8], header_type: Option<String>) -> NormalizedImage {
    let content_type = header_type
        .or_else(|| sniff_content_type(bytes).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
    NormalizedImage::new(content_type, general_purpose::STANDARD.encode(bytes))
}

/// Split a `data:` URL into content type and payload without touching the
/// payload bytes. Only base64-encoded data URLs are accepted.
fn parse_data_url(url: &str) -> Result<NormalizedImage> {
    let body = url
        .strip_prefix("data:")
        .ok_or_else(|| ScryError::Argument("not a data URL".to_string()))?;

    let (metadata, payload) = body.split_once(',').ok_or_else(|| {
        ScryError::Argument("data URL is missing its payload section".to_string())
    })?;

    let media_type = metadata.strip_suffix(";base64").ok_or_else(|| {
        ScryError::Argument("only base64-encoded data URLs are supported".to_string())
    })?;

    if payload.is_empty() {
        return Err(ScryError::Argument("data URL payload is empty".to_string()));
    }

    let content_type = if media_type.is_empty() {
        FALLBACK_CONTENT_TYPE.to_string()
    } else {
        media_type.to_string()
    };
    Ok(NormalizedImage::new(content_type, payload))
}
