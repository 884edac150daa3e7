//! SNS notification unwrapping.

use super::{MessageConverter, RawPayload};
use crate::error::ConversionError;
use serde_json::Value;

#[cfg(test)]
#[path = "sns_tests.rs"]
mod tests;

const NOTIFICATION_TYPE: &str = "Notification";

/// Reads the `Message` field of an SNS notification and hands it to the
/// inner converter.
///
/// Writing is not supported.
#[derive(Debug, Clone, Default)]
pub struct SnsMessageConverter<C> {
    inner: C,
}

impl<C> SnsMessageConverter<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<T, C> MessageConverter<T> for SnsMessageConverter<C>
where
    C: MessageConverter<T>,
{
    fn from_payload(&self, payload: RawPayload<'_>) -> Result<T, ConversionError> {
        let notification = payload.to_json()?;

        let Some(kind) = notification.get("Type") else {
            return Err(ConversionError::MissingAttribute {
                payload: payload.to_text(),
                attribute: "Type".to_string(),
            });
        };

        if kind.as_str() != Some(NOTIFICATION_TYPE) {
            return Err(ConversionError::NotANotification {
                payload: payload.to_text(),
            });
        }

        match notification.get("Message") {
            Some(Value::String(message)) => self.inner.from_payload(RawPayload::Text(message)),
            None => Err(ConversionError::MissingMessage {
                payload: payload.to_text(),
            }),
            Some(other) => self.inner.from_payload(RawPayload::Text(&other.to_string())),
        }
    }

    fn to_payload(&self, _payload: &T) -> Result<String, ConversionError> {
        Err(ConversionError::Unsupported(
            "This converter only supports reading a SNS notification and not writing them",
        ))
    }
}
