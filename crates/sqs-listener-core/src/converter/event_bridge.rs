//! EventBridge event unwrapping.

use super::{MessageConverter, RawPayload};
use crate::error::ConversionError;

#[cfg(test)]
#[path = "event_bridge_tests.rs"]
mod tests;

/// Reads the `detail` object of an EventBridge event and hands it to the
/// inner converter.
///
/// Writing is not supported.
#[derive(Debug, Clone, Default)]
pub struct EventBridgeMessageConverter<C> {
    inner: C,
}

impl<C> EventBridgeMessageConverter<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<T, C> MessageConverter<T> for EventBridgeMessageConverter<C>
where
    C: MessageConverter<T>,
{
    fn from_payload(&self, payload: RawPayload<'_>) -> Result<T, ConversionError> {
        let event = payload.to_json()?;

        match event.get("detail") {
            Some(detail) => self.inner.from_payload(RawPayload::Json(detail)),
            None => Err(ConversionError::MissingAttribute {
                payload: payload.to_text(),
                attribute: "detail".to_string(),
            }),
        }
    }

    fn to_payload(&self, _payload: &T) -> Result<String, ConversionError> {
        Err(ConversionError::Unsupported(
            "This converter only supports reading an EventBridge message and not writing them",
        ))
    }
}
