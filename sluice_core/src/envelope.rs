//! This module defines the `Envelope` struct wrapping a business message together
//! with its property bag (headers), the reserved property keys the broker relies
//! on, and the `BrokenMessage` placeholder returned when a persisted payload can
//! no longer be deserialized.

use std::collections::BTreeMap;

/// Ordered string-to-string property bag carried by every envelope.
///
/// Reserved keys are listed in [`keys`]; everything else is free-form
/// extension data that round-trips through storage untouched.
pub type Properties = BTreeMap<String, String>;

/// Reserved property keys understood by the broker.
pub mod keys {
    /// Unique message id, minted at dispatch time.
    pub const MESSAGE_ID: &str = "message_id";
    /// Logical message type name resolved through the name mapper.
    pub const MESSAGE_TYPE: &str = "message_type";
    /// Content type the body was serialized with.
    pub const CONTENT_TYPE: &str = "content_type";
    /// Optional content encoding applied on top of the content type.
    pub const CONTENT_ENCODING: &str = "content_encoding";
    /// Number of delivery attempts that have already failed.
    pub const RETRY_COUNT: &str = "retry_count";
    /// Delay in milliseconds before the next redelivery attempt.
    pub const RETRY_DELAY: &str = "retry_delay";
    /// Maximum number of redelivery attempts before dead-lettering.
    pub const RETRY_MAX: &str = "retry_max";
    /// Human-readable failure note recorded on the persisted headers when a
    /// message is rejected or its body fails to deserialize.
    pub const ERROR: &str = "error";
}

/// Immutable wrapper around a business message plus its property bag.
///
/// Envelopes are value types: deriving a new envelope with added or
/// overridden properties produces a new instance, never mutates in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    properties: Properties,
}

impl<M> Envelope<M> {
    /// Wraps a message with an empty property bag.
    pub fn new(message: M) -> Self {
        Self {
            message,
            properties: Properties::new(),
        }
    }

    /// Wraps a message with the given properties.
    pub fn with_properties(message: M, properties: Properties) -> Self {
        Self {
            message,
            properties,
        }
    }

    /// The wrapped business message.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// The full property bag.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Looks up a single property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns a new envelope with the given property added or overridden.
    pub fn with_property(&self, key: impl Into<String>, value: impl Into<String>) -> Self
    where
        M: Clone,
    {
        let mut properties = self.properties.clone();
        properties.insert(key.into(), value.into());
        Self {
            message: self.message.clone(),
            properties,
        }
    }

    /// Returns a new envelope with retry metadata attached.
    ///
    /// A message dispatched with retry metadata is rescheduled with the given
    /// delay on rejection, up to `max` attempts, instead of being
    /// dead-lettered on the first failure.
    pub fn with_retry(&self, delay_ms: u64, max: u32) -> Self
    where
        M: Clone,
    {
        let mut properties = self.properties.clone();
        properties.insert(keys::RETRY_COUNT.to_string(), "0".to_string());
        properties.insert(keys::RETRY_DELAY.to_string(), delay_ms.to_string());
        properties.insert(keys::RETRY_MAX.to_string(), max.to_string());
        Self {
            message: self.message.clone(),
            properties,
        }
    }

    /// Consumes the envelope, returning the message and properties.
    pub fn into_parts(self) -> (M, Properties) {
        (self.message, self.properties)
    }
}

/// Placeholder returned by the broker when a claimed row's body could not be
/// deserialized.
///
/// The underlying row is marked failed at the point the breakage is detected;
/// this value carries what is known about the payload so the consumer loop can
/// log and move on instead of stalling on one corrupt message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenMessage {
    /// The persisted type name, if any.
    pub message_type: Option<String>,
    /// The persisted content type, if any.
    pub content_type: Option<String>,
    /// Human-readable description of the deserialization failure.
    pub error: String,
}

/// Parses an unsigned integer property, treating absent or malformed values
/// as `None`.
pub(crate) fn parse_u32(properties: &Properties, key: &str) -> Option<u32> {
    properties.get(key).and_then(|v| v.parse().ok())
}

/// Parses an unsigned 64-bit integer property.
pub(crate) fn parse_u64(properties: &Properties, key: &str) -> Option<u64> {
    properties.get(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_property_does_not_mutate_original() {
        let envelope = Envelope::new("payload");
        let derived = envelope.with_property("tenant", "acme");

        assert!(envelope.property("tenant").is_none());
        assert_eq!(derived.property("tenant"), Some("acme"));
        assert_eq!(derived.message(), &"payload");
    }

    #[test]
    fn with_retry_sets_all_three_keys() {
        let envelope = Envelope::new(()).with_retry(5_000, 4);

        assert_eq!(envelope.property(keys::RETRY_COUNT), Some("0"));
        assert_eq!(envelope.property(keys::RETRY_DELAY), Some("5000"));
        assert_eq!(envelope.property(keys::RETRY_MAX), Some("4"));
    }

    #[test]
    fn properties_iterate_in_key_order() {
        let envelope = Envelope::new(())
            .with_property("b", "2")
            .with_property("a", "1");

        let seen: Vec<&str> = envelope.properties().keys().map(String::as_str).collect();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn malformed_numeric_property_reads_as_none() {
        let envelope = Envelope::new(()).with_property(keys::RETRY_COUNT, "not-a-number");
        assert_eq!(parse_u32(envelope.properties(), keys::RETRY_COUNT), None);
    }
}
