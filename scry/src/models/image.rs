use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::ScryError;

/// An image reference in any of the accepted input forms.
///
/// `Stream` holds an unread byte source and is consumed during normalization,
/// which is why this type is not `Clone`.
pub enum ImageSource {
    /// Remote location to fetch over HTTP.
    Url(String),
    /// Raw, unencoded image bytes.
    Bytes(Vec<u8>),
    /// An RFC 2397 `data:` URL, already carrying its own payload.
    DataUrl(String),
    /// An async byte stream, read to completion during normalization.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl ImageSource {
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        ImageSource::Stream(Box::new(reader))
    }

    /// True for inputs that carry no content at all: empty or whitespace-only
    /// strings, and empty byte buffers. Streams cannot be inspected without
    /// consuming them, so they are never considered blank here.
    pub fn is_blank(&self) -> bool {
        match self {
            ImageSource::Url(s) | ImageSource::DataUrl(s) => s.trim().is_empty(),
            ImageSource::Bytes(b) => b.is_empty(),
            ImageSource::Stream(_) => false,
        }
    }

    /// Short label used to correlate log lines and outcomes with their input.
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Url(url) => url.clone(),
            ImageSource::Bytes(bytes) => format!("bytes({})", bytes.len()),
            ImageSource::DataUrl(_) => "data-url".to_string(),
            ImageSource::Stream(_) => "stream".to_string(),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::DataUrl(_) => f.write_str("DataUrl(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<&str> for ImageSource {
    fn from(value: &str) -> Self {
        value.to_string().into()
    }
}

impl From<String> for ImageSource {
    fn from(value: String) -> Self {
        if value.trim_start().starts_with("data:") {
            ImageSource::DataUrl(value)
        } else {
            ImageSource::Url(value)
        }
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(value: Vec<u8>) -> Self {
        ImageSource::Bytes(value)
    }
}

impl From<NormalizedImage> for ImageSource {
    fn from(value: NormalizedImage) -> Self {
        ImageSource::DataUrl(value.data_url())
    }
}

/// The canonical form every input converges to: a content type plus the
/// base64-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedImage {
    pub content_type: String,
    /// Base64-encoded image bytes, exactly as they will be sent upstream.
    pub data: String,
}

impl NormalizedImage {
    pub fn new(content_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.content_type, self.data)
    }

    /// Size in bytes of the decoded payload, computed from the base64 text
    /// without decoding it. Approximate when the payload is not canonical
    /// base64, which passthrough inputs are allowed to be.
    pub fn content_length(&self) -> u64 {
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding) as u64
    }
}

/// Per-input result of bulk normalization. Exactly one of `image` and `error`
/// is set.
#[derive(Debug)]
pub struct NormalizeOutcome {
    /// Label from [`ImageSource::describe`] identifying the originating input.
    pub source: String,
    pub image: Option<NormalizedImage>,
    /// Content type resolved during normalization. Present on success.
    pub content_type: Option<String>,
    /// Decoded payload size in bytes. Present on success.
    pub content_length: Option<u64>,
    /// Wall-clock time spent on this input. Zero for data URL passthroughs.
    pub duration_ms: u64,
    pub error: Option<ScryError>,
}

impl NormalizeOutcome {
    pub fn ok(source: String, image: NormalizedImage, duration_ms: u64) -> Self {
        Self {
            source,
            content_type: Some(image.content_type.clone()),
            content_length: Some(image.content_length()),
            image: Some(image),
            duration_ms,
            error: None,
        }
    }

    pub fn err(source: String, error: ScryError, duration_ms: u64) -> Self {
        Self {
            source,
            image: None,
            content_type: None,
            content_length: None,
            duration_ms,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.image.is_some()
    }
}
