use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::OcrApiConfig;
use crate::error::{Result, ScryError};
use crate::models::NormalizedImage;
use crate::ocr::OcrEngine;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/v1";
pub const DEFAULT_PROMPT: &str = "Extract all text from this image. Return only the extracted text without any explanations or formatting.";

/// Recognized text as returned by the provider, plus whatever extra fields
/// the provider attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPayload {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u32>,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    result: Option<OcrPayload>,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: Option<ErrorCode>,
    #[serde(default)]
    message: Option<String>,
}

/// Numeric on the wire; tolerated as a string too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorCode {
    Number(i64),
    Text(String),
}

impl ErrorCode {
    fn as_text(&self) -> String {
        match self {
            ErrorCode::Number(n) => n.to_string(),
            ErrorCode::Text(s) => s.clone(),
        }
    }
}

/// HTTP client for the OCR gateway protocol.
///
/// Every response body is a `{success, result, errors}` envelope, even for
/// provider-side failures, so HTTP status and envelope contents are
/// interpreted separately. One call makes exactly one request.
#[derive(Debug, Clone)]
pub struct OcrApiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    prompt: String,
    max_tokens: u32,
}

impl OcrApiClient {
    pub fn new(config: &OcrApiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ScryError::Auth("OCR API key not configured".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ScryError::TransientProvider(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: config.model.clone(),
            prompt: config
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            max_tokens: config.max_tokens,
        })
    }

    async fn request_once(
        &self,
        image: &NormalizedImage,
        prompt: Option<&str>,
    ) -> Result<OcrPayload> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt.unwrap_or(&self.prompt),
            "image": image.data_url(),
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScryError::Timeout(format!("OCR API request timed out: {}", e))
                } else {
                    ScryError::TransientProvider(format!("OCR API request failed: {}", e))
                }
            })?;

        interpret_response(response).await
    }
}

#[async_trait]
impl OcrEngine for OcrApiClient {
    async fn recognize(&self, image: &NormalizedImage, prompt: Option<&str>) -> Result<OcrPayload> {
        self.request_once(image, prompt).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

async fn interpret_response(response: reqwest::Response) -> Result<OcrPayload> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ScryError::Auth(format!(
            "OCR API rejected credentials ({})",
            status
        )));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ScryError::TransientProvider(
            "OCR API rate limited the request (429)".to_string(),
        ));
    }
    if status.is_server_error() {
        return Err(ScryError::TransientProvider(format!(
            "OCR API returned {}",
            status
        )));
    }
    if !status.is_success() {
        // Rejections usually still carry an envelope explaining themselves.
        let detail = match response.text().await {
            Ok(body) => serde_json::from_str::<Envelope>(&body)
                .ok()
                .and_then(|envelope| first_error_text(&envelope)),
            Err(_) => None,
        };
        return Err(ScryError::ProviderReported(
            detail.unwrap_or_else(|| format!("OCR API returned {}", status)),
        ));
    }

    let body = response.text().await.map_err(|e| {
        ScryError::TransientProvider(format!("Failed to read OCR API response: {}", e))
    })?;

    let envelope: Envelope = serde_json::from_str(&body)
        .map_err(|e| ScryError::Parsing(format!("Invalid response envelope: {}", e)))?;

    if !envelope.success {
        let message = first_error_text(&envelope)
            .unwrap_or_else(|| "unknown provider error".to_string());
        return Err(ScryError::ProviderReported(message));
    }

    envelope.result.ok_or_else(|| {
        ScryError::Parsing("response envelope reported success without a result".to_string())
    })
}

fn first_error_text(envelope: &Envelope) -> Option<String> {
    let first = envelope.errors.first()?;
    first
        .message
        .clone()
        .or_else(|| first.code.as_ref().map(ErrorCode::as_text))
}
