use async_trait::async_trait;

use crate::config::OcrApiConfig;
use crate::error::{Result, ScryError};
use crate::models::NormalizedImage;
use crate::ocr::{OcrApiClient, OcrEngine, OcrPayload};

#[derive(Debug, Clone)]
enum Backend {
    Api(OcrApiClient),
    Unavailable { reason: String },
}

/// Engine wrapper that picks a usable backend at construction time.
///
/// Construction never fails: with no usable backend the provider still
/// exists, and every recognition call reports the reason it cannot run. That
/// keeps startup working in environments without credentials.
#[derive(Debug, Clone)]
pub struct OcrProvider {
    backend: Backend,
    model: String,
}

impl OcrProvider {
    pub fn new(config: &OcrApiConfig) -> Self {
        let backend = match OcrApiClient::new(config) {
            Ok(client) => {
                tracing::info!("OCR provider ready (model: {})", config.model);
                Backend::Api(client)
            }
            Err(error) => {
                tracing::warn!(
                    "OCR provider unavailable, requests will fail until configured: {}",
                    error
                );
                let reason = match error {
                    ScryError::Auth(message) => message,
                    other => other.to_string(),
                };
                Backend::Unavailable { reason }
            }
        };

        Self {
            backend,
            model: config.model.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.backend, Backend::Api(_))
    }
}

#[async_trait]
impl OcrEngine for OcrProvider {
    async fn recognize(&self, image: &NormalizedImage, prompt: Option<&str>) -> Result<OcrPayload> {
        match &self.backend {
            Backend::Api(client) => client.recognize(image, prompt).await,
            Backend::Unavailable { reason } => Err(ScryError::Auth(reason.clone())),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(api_key: Option<&str>) -> OcrApiConfig {
        OcrApiConfig {
            model: "test-model".to_string(),
            api_key: api_key.map(str::to_string),
            base_url: Some("http://localhost:9".to_string()),
            prompt: None,
            max_tokens: 512,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_provider_available_with_key() {
        let provider = OcrProvider::new(&config_with_key(Some("key")));
        assert!(provider.is_available());
        assert_eq!(provider.model(), "test-model");
    }

    #[tokio::test]
    async fn test_provider_degrades_without_key() {
        let provider = OcrProvider::new(&config_with_key(None));
        assert!(!provider.is_available());

        let image = NormalizedImage::new("image/png", "aGVsbG8=");
        let err = provider.recognize(&image, None).await.unwrap_err();
        match err {
            ScryError::Auth(reason) => assert!(reason.contains("not configured")),
            other => panic!("expected Auth, got {:?}", other),
        }
    }
}
