//! This module defines the `MessageBroker` trait — the durable queue's
//! dispatch/get/ack/reject surface — together with the `Delivery` type
//! returned from claims.

use crate::envelope::{BrokenMessage, Envelope, Properties, keys};
use crate::retry::RetryPolicy;
use crate::serializer::CONTENT_TYPE_JSON;
use async_trait::async_trait;

/// Broker configuration shared by the storage backends.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue partition this broker dispatches to and claims from.
    pub queue: String,
    /// Content type used to serialize bodies when the envelope does not name
    /// one.
    pub content_type: String,
    /// Defaults applied when retry metadata omits a delay or a maximum.
    pub retry: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// The payload of a claimed message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody<M> {
    /// The body deserialized cleanly.
    Intact(M),
    /// The body could not be deserialized; the row has already been marked
    /// failed.
    Broken(BrokenMessage),
}

/// A message as seen by a consumer: the reconstructed envelope content plus
/// the claim handle.
///
/// `serial` is the handle used for ack/reject bookkeeping. It is `None` only
/// for envelopes synthesized outside the broker (never claimed from a row);
/// rejecting such a delivery with retry metadata re-dispatches it as a brand
/// new row.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<M> {
    /// Storage ordering key and claim handle, when the message came off a row.
    pub serial: Option<i64>,
    /// The message body, or the broken-message placeholder.
    pub body: MessageBody<M>,
    /// The reconstructed property bag.
    pub properties: Properties,
}

impl<M> Delivery<M> {
    /// Builds a delivery from an envelope that was never persisted.
    pub fn synthesized(envelope: Envelope<M>) -> Self {
        let (message, properties) = envelope.into_parts();
        Self {
            serial: None,
            body: MessageBody::Intact(message),
            properties,
        }
    }

    /// The intact message, if the body deserialized.
    pub fn message(&self) -> Option<&M> {
        match &self.body {
            MessageBody::Intact(message) => Some(message),
            MessageBody::Broken(_) => None,
        }
    }

    /// The broken-message placeholder, if the body did not deserialize.
    pub fn broken(&self) -> Option<&BrokenMessage> {
        match &self.body {
            MessageBody::Intact(_) => None,
            MessageBody::Broken(broken) => Some(broken),
        }
    }

    /// Looks up a single property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The message id recorded on this delivery, if any.
    pub fn message_id(&self) -> Option<&str> {
        self.property(keys::MESSAGE_ID)
    }
}

/// Durable, per-queue-FIFO, at-least-once message queue over a relational
/// table.
///
/// `get` must claim-and-mark in a single atomic statement so that two
/// concurrent callers never claim the same row; everything else builds on
/// that guarantee.
#[async_trait]
pub trait MessageBroker<M>: Send + Sync {
    /// The error raised by broker operations. Storage failures propagate to
    /// the caller unchanged; durability depends on the caller seeing them.
    type Error: std::error::Error + Send + Sync;

    /// Serializes the envelope and inserts one durable row into the queue.
    ///
    /// A fresh message id is minted for every dispatch so a resend never
    /// collides with a previous delivery's identity.
    async fn dispatch(&self, envelope: Envelope<M>) -> Result<(), Self::Error>;

    /// Atomically claims the oldest claimable row in the queue, in `serial`
    /// order, and returns it reconstructed. Returns `None` when nothing is
    /// claimable.
    ///
    /// A row whose body fails to deserialize is marked failed on the spot and
    /// surfaced as a [`MessageBody::Broken`] delivery rather than an error,
    /// so one corrupt payload cannot stall the consumer loop.
    async fn get(&self) -> Result<Option<Delivery<M>>, Self::Error>;

    /// Acknowledges a delivery.
    ///
    /// This is deliberately a no-op: acknowledgement already happened
    /// atomically at claim time when `consumed_at` was written. The trade-off
    /// is that a crash during handler execution after the claim loses the
    /// message unless the caller wraps processing in its own durability
    /// mechanism.
    async fn ack(&self, delivery: &Delivery<M>) -> Result<(), Self::Error>;

    /// Rejects a delivery, scheduling a retry or dead-lettering it according
    /// to its retry metadata (see [`crate::retry::decide`]).
    async fn reject(
        &self,
        delivery: Delivery<M>,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_delivery_has_no_serial() {
        let envelope = Envelope::new("payload").with_property(keys::MESSAGE_ID, "abc");
        let delivery = Delivery::synthesized(envelope);

        assert_eq!(delivery.serial, None);
        assert_eq!(delivery.message(), Some(&"payload"));
        assert_eq!(delivery.message_id(), Some("abc"));
    }

    #[test]
    fn broken_delivery_exposes_placeholder() {
        let delivery: Delivery<String> = Delivery {
            serial: Some(7),
            body: MessageBody::Broken(BrokenMessage {
                message_type: Some("Foo".to_string()),
                content_type: None,
                error: "bad payload".to_string(),
            }),
            properties: Properties::new(),
        };

        assert!(delivery.message().is_none());
        assert_eq!(delivery.broken().unwrap().error, "bad payload");
    }
}
