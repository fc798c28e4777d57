//! Decoding of the inference payload embedded in metadata records.
//!
//! Devices ship each inference result as an encoded string in the `O` field
//! of `Inferences[0]`. The receiver does not own that wire format; it only
//! needs something that turns the string into JSON it can store next to the
//! record. [`InferenceDecoder`] is that seam.

use crate::config::DecoderKind;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while decoding an inference payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a JSON document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("Unsupported payload: {0}")]
    Unsupported(String),
}

/// Turns the opaque `O` string into a JSON-serializable value
///
/// Implementations must be pure: the pipeline calls them from the blocking
/// pool with no ordering between requests.
#[cfg_attr(test, mockall::automock)]
pub trait InferenceDecoder: Send + Sync {
    fn decode(&self, encoded: &str) -> Result<Value, DecodeError>;
}

/// Base64 wrapping a UTF-8 JSON document
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64JsonDecoder;

impl InferenceDecoder for Base64JsonDecoder {
    fn decode(&self, encoded: &str) -> Result<Value, DecodeError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        if bytes.is_empty() {
            return Err(DecodeError::Unsupported("empty payload".to_string()));
        }
        let text = std::str::from_utf8(&bytes)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Base64 of arbitrary bytes, reported as size plus canonical base64
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64BytesDecoder;

impl InferenceDecoder for Base64BytesDecoder {
    fn decode(&self, encoded: &str) -> Result<Value, DecodeError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Ok(json!({
            "size": bytes.len(),
            "base64": STANDARD.encode(&bytes),
        }))
    }
}

/// Build the decoder selected in configuration
///
/// `DecoderKind::None` yields `None`: records are stored without a
/// `DeserializedData` field.
pub fn from_kind(kind: DecoderKind) -> Option<Arc<dyn InferenceDecoder>> {
    match kind {
        DecoderKind::Base64Json => Some(Arc::new(Base64JsonDecoder)),
        DecoderKind::Base64Bytes => Some(Arc::new(Base64BytesDecoder)),
        DecoderKind::None => None,
    }
}
