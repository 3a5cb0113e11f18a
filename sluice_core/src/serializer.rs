//! Collaborator interfaces for turning messages into bytes and back, and for
//! mapping in-process types to logical wire names. Default JSON
//! implementations are provided; backends consume the traits only.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Content type used by the default [`JsonSerializer`].
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors raised by serializer and name-mapper collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The message could not be serialized.
    #[error("failed to serialize message as '{content_type}': {source}")]
    Serialize {
        /// The content type that was requested.
        content_type: String,
        /// The underlying encoder error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The persisted body could not be deserialized.
    #[error("failed to deserialize '{type_name}' as '{content_type}': {source}")]
    Deserialize {
        /// The persisted logical type name.
        type_name: String,
        /// The persisted content type.
        content_type: String,
        /// The underlying decoder error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The serializer does not handle the requested content type.
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
}

/// Serializes messages to bytes and reconstructs them from persisted rows.
pub trait MessageSerializer<M>: Send + Sync {
    /// Encodes a message with the given content type.
    fn serialize(&self, message: &M, content_type: &str) -> Result<Vec<u8>, SerializationError>;

    /// Decodes a persisted body. `type_name` is the logical name recorded at
    /// dispatch time; self-describing formats may ignore it.
    fn deserialize(
        &self,
        type_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<M, SerializationError>;
}

/// Maps in-process message values to logical wire/storage type names, keeping
/// persisted names decoupled from Rust type identifiers.
pub trait NameMapper<M>: Send + Sync {
    /// The logical name to persist for this message.
    fn name_for(&self, message: &M) -> String;
}

/// Gives a message value a stable logical name.
///
/// Typically implemented on a message enum, returning one name per variant,
/// e.g. `OrderPlaced` or `InvoicePaid`.
pub trait MessageName {
    /// The logical name of this message.
    fn message_name(&self) -> &str;
}

/// A [`NameMapper`] that reads the name off the message itself via
/// [`MessageName`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageNameMapper;

impl<M> NameMapper<M> for MessageNameMapper
where
    M: MessageName + Send + Sync,
{
    fn name_for(&self, message: &M) -> String {
        message.message_name().to_string()
    }
}

/// JSON serializer over serde. Only handles [`CONTENT_TYPE_JSON`]; the
/// persisted type name is not needed to decode because serde tagging makes
/// the payload self-describing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<M> MessageSerializer<M> for JsonSerializer
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, message: &M, content_type: &str) -> Result<Vec<u8>, SerializationError> {
        if content_type != CONTENT_TYPE_JSON {
            return Err(SerializationError::UnsupportedContentType(
                content_type.to_string(),
            ));
        }
        serde_json::to_vec(message).map_err(|e| SerializationError::Serialize {
            content_type: content_type.to_string(),
            source: Box::new(e),
        })
    }

    fn deserialize(
        &self,
        type_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<M, SerializationError> {
        if content_type != CONTENT_TYPE_JSON {
            return Err(SerializationError::UnsupportedContentType(
                content_type.to_string(),
            ));
        }
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Deserialize {
            type_name: type_name.to_string(),
            content_type: content_type.to_string(),
            source: Box::new(e),
        })
    }
}
