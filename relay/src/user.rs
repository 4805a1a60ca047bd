//! Decoding of the user a flag evaluation is performed for.
//!
//! GET-style requests carry the user as base64-encoded JSON in a path
//! segment, REPORT-style requests carry the same JSON as the request body.
//! Both decode to the same [`UserContext`].

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::{Map, Value};

/// Attribute holding the unique subject key.
pub const SUBJECT_KEY_ATTRIBUTE: &str = "key";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UserDecodeError {
    #[error("user segment is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("user is not a valid JSON object: {0}")]
    InvalidUserJson(String),
    #[error("user has no \"key\" attribute")]
    MissingSubjectKey,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UserContext {
    attributes: Map<String, Value>,
}

impl UserContext {
    /// Validates a decoded JSON value as a user.
    pub fn from_value(value: Value) -> Result<Self, UserDecodeError> {
        let Value::Object(attributes) = value else {
            return Err(UserDecodeError::InvalidUserJson(
                "expected a JSON object".to_string(),
            ));
        };

        match attributes.get(SUBJECT_KEY_ATTRIBUTE) {
            Some(Value::String(key)) if !key.is_empty() => Ok(Self { attributes }),
            _ => Err(UserDecodeError::MissingSubjectKey),
        }
    }

    pub fn key(&self) -> &str {
        self.attributes
            .get(SUBJECT_KEY_ATTRIBUTE)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }
}

/// Decodes a user from a base64 path segment.
///
/// Both the URL-safe and the standard alphabet are accepted, with or without
/// padding. Padding may arrive percent-encoded.
pub fn decode_from_path(segment: &str) -> Result<UserContext, UserDecodeError> {
    let mut unpadded = segment.trim();
    loop {
        let stripped = unpadded
            .strip_suffix('=')
            .or_else(|| unpadded.strip_suffix("%3D"))
            .or_else(|| unpadded.strip_suffix("%3d"));
        match stripped {
            Some(rest) => unpadded = rest,
            None => break,
        }
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| STANDARD_NO_PAD.decode(unpadded))
        .map_err(|e| UserDecodeError::InvalidEncoding(e.to_string()))?;

    decode_from_body(&bytes)
}

/// Decodes a user from a JSON document.
///
/// Anything but whitespace after the JSON value is rejected.
pub fn decode_from_body(bytes: &[u8]) -> Result<UserContext, UserDecodeError> {
    // from_slice rejects trailing characters
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| UserDecodeError::InvalidUserJson(e.to_string()))?;

    UserContext::from_value(value)
}
