use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ScryError};

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub normalizer: NormalizerConfig,
    pub ocr: OcrApiConfig,
}

/// Operating limits for the invoker and the admission pipeline.
///
/// `retry_count` is the total number of attempts per request, not the number
/// of retries after the first attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrency: usize,
    pub retry_count: u32,
    pub request_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_count: usize,
    pub statistics_window: Duration,
    pub channel_capacity: usize,
}

/// Limits for bulk normalization, separate from the invoker's so that remote
/// fetches cannot starve provider calls.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    pub max_concurrency: usize,
    pub fetch_attempts: u32,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrApiConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub prompt: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: parse_env_or("SCRY_MAX_CONCURRENCY", 4),
            retry_count: parse_env_or("SCRY_RETRY_COUNT", 3),
            request_timeout: Duration::from_secs(parse_env_or("SCRY_REQUEST_TIMEOUT_SECS", 60)),
            rate_limit_window: Duration::from_millis(parse_env_or(
                "SCRY_RATE_LIMIT_WINDOW_MS",
                1000,
            )),
            rate_limit_count: parse_env_or("SCRY_RATE_LIMIT_COUNT", 10),
            statistics_window: Duration::from_secs(parse_env_or("SCRY_STATS_WINDOW_SECS", 10)),
            channel_capacity: parse_env_or("SCRY_CHANNEL_CAPACITY", 256),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: parse_env_or("SCRY_TRANSFORM_CONCURRENCY", 8),
            fetch_attempts: parse_env_or("SCRY_FETCH_ATTEMPTS", 3),
            fetch_timeout: Duration::from_secs(parse_env_or("SCRY_FETCH_TIMEOUT_SECS", 30)),
        }
    }
}

impl Default for OcrApiConfig {
    fn default() -> Self {
        Self {
            model: env::var("OCR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: env::var("OCR_API_KEY").ok(),
            base_url: env::var("OCR_BASE_URL").ok(),
            prompt: env::var("OCR_PROMPT").ok(),
            max_tokens: parse_env_or("OCR_MAX_TOKENS", 4096),
            timeout_secs: parse_env_or("OCR_TIMEOUT", 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            normalizer: NormalizerConfig::default(),
            ocr: OcrApiConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ScryError::Argument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry_count == 0 {
            return Err(ScryError::Argument(
                "retry_count must be at least 1 total attempt".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ScryError::Argument(
                "request_timeout must be positive".to_string(),
            ));
        }
        if self.rate_limit_window.is_zero() {
            return Err(ScryError::Argument(
                "rate_limit_window must be positive".to_string(),
            ));
        }
        if self.rate_limit_count == 0 {
            return Err(ScryError::Argument(
                "rate_limit_count must be at least 1".to_string(),
            ));
        }
        if self.statistics_window.is_zero() {
            return Err(ScryError::Argument(
                "statistics_window must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ScryError::Argument(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ScryError::Argument(
                "normalizer max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.fetch_attempts == 0 {
            return Err(ScryError::Argument(
                "fetch_attempts must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ScryError::Argument(
                "fetch_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
