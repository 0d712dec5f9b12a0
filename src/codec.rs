//! Payload encoding and the type-name metadata convention.
//!
//! Payloads are JSON. Every descriptor also carries a small JSON metadata
//! document naming the event type, so a record can be routed back to its
//! decoder even when the store-level type field is blank.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::record::{EventRecord, RawEventRecord};

/// Content type written into metadata for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors raised while decoding a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload for event type '{0}'")]
    EmptyPayload(String),

    #[error("unknown event type '{0}'")]
    UnknownType(String),

    #[error("malformed payload for event type '{event_type}': {message}")]
    Malformed { event_type: String, message: String },
}

/// Error raised while encoding an event for append.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode '{event_type}': {source}")]
pub struct EncodeError {
    pub event_type: String,
    #[source]
    pub source: serde_json::Error,
}

/// Outcome of decoding one payload.
///
/// `Skip` is for payloads the event type knows about but deliberately ignores
/// (retired event types, for example).
#[derive(Debug)]
pub enum Decoded<E> {
    Event(E),
    Skip,
    Error(DecodeError),
}

impl<E> Decoded<E> {
    pub fn map<U>(self, f: impl FnOnce(E) -> U) -> Decoded<U> {
        match self {
            Decoded::Event(e) => Decoded::Event(f(e)),
            Decoded::Skip => Decoded::Skip,
            Decoded::Error(e) => Decoded::Error(e),
        }
    }
}

/// A domain event that knows its stable type name and wire encoding.
pub trait DomainEvent: Sized + Send + Sync + 'static {
    /// Stable type name written as the record type.
    fn event_type(&self) -> &'static str;

    /// Encode the payload.
    fn encode(&self) -> Result<Bytes, EncodeError>;

    /// Decode a payload stored under `event_type`.
    ///
    /// Must not panic and must not have side effects.
    fn decode(event_type: &str, data: &[u8]) -> Decoded<Self>;
}

/// Metadata document stored next to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

impl EventMetadata {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: None,
            content_type: default_content_type(),
        }
    }

    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| EncodeError {
                event_type: self.event_type.clone(),
                source,
            })
    }

    /// Parse metadata bytes; `None` when absent or not ours.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(bytes).ok()
    }
}

/// Serialize a payload as JSON.
pub fn encode_json<T: Serialize>(event_type: &str, value: &T) -> Result<Bytes, EncodeError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| EncodeError {
            event_type: event_type.to_string(),
            source,
        })
}

/// Deserialize a JSON payload, reporting failures as [`Decoded::Error`].
pub fn decode_json<T: DeserializeOwned>(event_type: &str, data: &[u8]) -> Decoded<T> {
    match serde_json::from_slice(data) {
        Ok(value) => Decoded::Event(value),
        Err(e) => Decoded::Error(DecodeError::Malformed {
            event_type: event_type.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Effective type of a record: the store type, else the metadata type.
pub fn resolve_event_type(record: &RawEventRecord) -> Option<String> {
    if !record.event_type.is_empty() {
        return Some(record.event_type.clone());
    }
    EventMetadata::from_bytes(&record.metadata)
        .map(|m| m.event_type)
        .filter(|t| !t.is_empty())
}

/// Decode a raw record into a typed one.
pub fn decode_record<E: DomainEvent>(record: RawEventRecord) -> Decoded<EventRecord<E>> {
    let Some(event_type) = resolve_event_type(&record) else {
        return Decoded::Error(DecodeError::UnknownType(String::new()));
    };
    if record.data.is_empty() {
        return Decoded::Error(DecodeError::EmptyPayload(event_type));
    }
    match E::decode(&event_type, &record.data) {
        Decoded::Event(event) => Decoded::Event(record.with_data(event)),
        Decoded::Skip => Decoded::Skip,
        Decoded::Error(e) => Decoded::Error(e),
    }
}
