//! Opaque payloads carried over the duplex transport.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;

/// A single frame's payload.
///
/// Structured values travel as JSON text. Incoming frames that are not valid JSON are
/// kept verbatim as [`Message::Text`] rather than rejected.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Structured payload, serialized as JSON on the wire
    Json(Value),
    /// Raw text passed through untouched
    Text(String),
}

impl Message {
    /// Serialize any value into a JSON message.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    #[must_use]
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::Text(text.into())
    }

    /// Decode an incoming text frame, falling back to the raw string when it is not JSON.
    #[must_use]
    pub fn from_frame(frame: &str) -> Self {
        match serde_json::from_str(frame) {
            Ok(value) => Self::Json(value),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(error = %_e, "Frame is not JSON, delivering raw text");
                Self::Text(frame.to_owned())
            }
        }
    }

    /// Text frame to put on the wire.
    #[must_use]
    pub fn to_frame(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }

    /// Interpret this payload as a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match self {
            Self::Json(value) => T::deserialize(value)?,
            Self::Text(text) => serde_json::from_str(text)?,
        };
        Ok(value)
    }

    #[must_use]
    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Text(text) => Some(text),
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}
