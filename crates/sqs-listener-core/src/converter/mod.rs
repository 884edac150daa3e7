//! Payload conversion.
//!
//! A [`MessageConverter<T>`] turns the raw body of a received message into
//! the listener's payload type `T`. Conversion is the first pipeline stage; a
//! failure marks the message as failed without invoking the listener.
//!
//! Wrapping converters ([`SnsMessageConverter`], [`EventBridgeMessageConverter`])
//! unwrap an envelope format and delegate the inner payload to another
//! converter. They are read-only.

use crate::error::ConversionError;
use crate::message::MessageEnvelope;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;

mod event_bridge;
mod sns;

pub use event_bridge::EventBridgeMessageConverter;
pub use sns::SnsMessageConverter;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Raw payload handed to a converter
#[derive(Debug, Clone, Copy)]
pub enum RawPayload<'a> {
    /// Message body text, usually JSON
    Text(&'a str),
    /// Already parsed JSON, as produced by wrapping converters
    Json(&'a Value),
}

impl RawPayload<'_> {
    /// Render the payload as text for error messages
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => (*text).to_string(),
            Self::Json(value) => value.to_string(),
        }
    }

    /// Parse the payload as JSON
    pub fn to_json(&self) -> Result<Value, ConversionError> {
        match self {
            Self::Text(text) => {
                serde_json::from_str(text).map_err(|source| ConversionError::InvalidJson { source })
            }
            Self::Json(value) => Ok((*value).clone()),
        }
    }
}

/// Converts raw message payloads into `T`
pub trait MessageConverter<T>: Send + Sync {
    fn from_payload(&self, payload: RawPayload<'_>) -> Result<T, ConversionError>;

    fn from_message(&self, envelope: &MessageEnvelope) -> Result<T, ConversionError> {
        self.from_payload(RawPayload::Text(&envelope.body))
    }

    /// Convert each message independently; one failure does not affect the
    /// others
    fn from_messages(&self, envelopes: &[MessageEnvelope]) -> Vec<Result<T, ConversionError>> {
        envelopes
            .iter()
            .map(|envelope| self.from_message(envelope))
            .collect()
    }

    fn to_payload(&self, payload: &T) -> Result<String, ConversionError>;
}

// ============================================================================
// String Converter
// ============================================================================

/// Passes the body through as a `String`
#[derive(Debug, Clone, Copy, Default)]
pub struct StringMessageConverter;

impl MessageConverter<String> for StringMessageConverter {
    fn from_payload(&self, payload: RawPayload<'_>) -> Result<String, ConversionError> {
        match payload {
            RawPayload::Text(text) => Ok(text.to_string()),
            RawPayload::Json(Value::String(text)) => Ok(text.clone()),
            RawPayload::Json(value) => Ok(value.to_string()),
        }
    }

    fn to_payload(&self, payload: &String) -> Result<String, ConversionError> {
        Ok(payload.clone())
    }
}

// ============================================================================
// JSON Converter
// ============================================================================

/// Deserializes the body as JSON into `T`
pub struct JsonMessageConverter<T> {
    _target: PhantomData<fn() -> T>,
}

impl<T> JsonMessageConverter<T> {
    pub fn new() -> Self {
        Self {
            _target: PhantomData,
        }
    }
}

impl<T> Default for JsonMessageConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonMessageConverter<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonMessageConverter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonMessageConverter")
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> MessageConverter<T> for JsonMessageConverter<T>
where
    T: DeserializeOwned + Serialize,
{
    fn from_payload(&self, payload: RawPayload<'_>) -> Result<T, ConversionError> {
        let result = match payload {
            RawPayload::Text(text) => serde_json::from_str(text),
            RawPayload::Json(value) => <T as Deserialize>::deserialize(value),
        };

        result.map_err(|e| ConversionError::Deserialization {
            target: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    fn to_payload(&self, payload: &T) -> Result<String, ConversionError> {
        serde_json::to_string(payload).map_err(|e| ConversionError::Serialization {
            message: e.to_string(),
        })
    }
}
