use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use crate::error::{Result, ScryError};

use super::Normalizer;

struct AttemptFailure {
    message: String,
    transient: bool,
}

impl Normalizer {
    /// Fetch a remote image, returning the body and the `Content-Type` header
    /// value if the server sent a usable one.
    ///
    /// Transport errors, 429s, and 5xx responses are retried with exponential
    /// backoff up to the configured attempt budget. Any other non-success
    /// status fails immediately, as does a reference that is not an http(s)
    /// URL at all.
    pub(super) async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let parsed =
            Url::parse(url).map_err(|e| ScryError::Fetch(format!("invalid URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ScryError::Fetch(format!(
                "unsupported URL scheme '{}' for {}",
                parsed.scheme(),
                url
            )));
        }

        let attempts = self.config.fetch_attempts;
        let mut last_failure: Option<AttemptFailure> = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff = Duration::from_millis(100 * 2_u64.pow(attempt - 2));
                tokio::time::sleep(backoff).await;
            }

            match self.try_fetch(url).await {
                Ok(fetched) => return Ok(fetched),
                Err(failure) => {
                    if !failure.transient {
                        return Err(ScryError::Fetch(failure.message));
                    }
                    if attempt < attempts {
                        tracing::warn!(
                            "Fetch attempt {}/{} for {} failed: {}. Retrying.",
                            attempt,
                            attempts,
                            url,
                            failure.message
                        );
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let message = last_failure
            .map(|f| f.message)
            .unwrap_or_else(|| format!("no fetch attempts were made for {}", url));
        Err(ScryError::Fetch(message))
    }

    async fn try_fetch(
        &self,
        url: &str,
    ) -> std::result::Result<(Vec<u8>, Option<String>), AttemptFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AttemptFailure {
                message: format!("request to {} failed: {}", url, e),
                transient: true,
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptFailure {
                message: format!("{} returned {}", url, status),
                transient: true,
            });
        }
        if !status.is_success() {
            return Err(AttemptFailure {
                message: format!("{} returned {}", url, status),
                transient: false,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty());

        let bytes = response.bytes().await.map_err(|e| AttemptFailure {
            message: format!("failed to read body from {}: {}", url, e),
            transient: true,
        })?;

        if bytes.is_empty() {
            return Err(AttemptFailure {
                message: format!("{} returned an empty body", url),
                transient: false,
            });
        }

        Ok((bytes.to_vec(), content_type))
    }
}
